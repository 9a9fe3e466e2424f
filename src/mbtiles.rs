//! MBTiles file-source workers. Each worker thread holds its own read-only
//! SQLite connections, one per archive, opened lazily and never shared
//! across threads. Handlers reach them through the global [`FileSources`]
//! pool (min 0, max 16).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde_json::{json, Map, Value};

use crate::error::ServiceError;
use crate::pool::{Pool, DEFAULT_IDLE_TIMEOUT};
use crate::worker::Worker;

/// Outcome of a file-source request. Callers check `error` first, then
/// `no_content`, then `data`.
#[derive(Debug, Default)]
pub struct SourceResponse {
    pub data: Option<Vec<u8>>,
    pub error: Option<String>,
    pub no_content: bool,
}

impl SourceResponse {
    fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    fn with_error(message: String) -> Self {
        Self {
            error: Some(message),
            ..Self::default()
        }
    }

    fn empty() -> Self {
        Self {
            no_content: true,
            ..Self::default()
        }
    }
}

/// The per-worker resource: lazily opened read-only connections.
pub struct FileSource {
    connections: HashMap<PathBuf, Connection>,
}

impl FileSource {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    fn connection(&mut self, path: &Path) -> Result<&Connection, rusqlite::Error> {
        if !self.connections.contains_key(path) {
            let connection = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            self.connections.insert(path.to_path_buf(), connection);
        }
        Ok(self.connections.get(path).expect("inserted above"))
    }

    /// Fetches one tile, translating the XYZ row into the TMS row MBTiles
    /// stores. Missing rows are no-content, not errors.
    pub fn tile(&mut self, path: &Path, z: u8, x: u32, y: u32) -> SourceResponse {
        let rows = 1u32 << z;
        if y >= rows || x >= rows {
            return SourceResponse::empty();
        }
        let connection = match self.connection(path) {
            Ok(connection) => connection,
            Err(err) => return SourceResponse::with_error(err.to_string()),
        };
        let tms_row = rows - 1 - y;
        let result = connection
            .query_row(
                "SELECT tile_data FROM tiles \
                 WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
                rusqlite::params![z, x, tms_row],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional();
        match result {
            Ok(Some(data)) => SourceResponse::with_data(data),
            Ok(None) => SourceResponse::empty(),
            Err(err) => SourceResponse::with_error(err.to_string()),
        }
    }

    /// Builds a TileJSON-shaped document out of the archive's `metadata`
    /// table.
    pub fn source(&mut self, path: &Path) -> SourceResponse {
        let connection = match self.connection(path) {
            Ok(connection) => connection,
            Err(err) => return SourceResponse::with_error(err.to_string()),
        };
        let mut document = Map::new();
        let mut statement = match connection.prepare("SELECT name, value FROM metadata") {
            Ok(statement) => statement,
            Err(err) => return SourceResponse::with_error(err.to_string()),
        };
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        });
        let rows = match rows {
            Ok(rows) => rows,
            Err(err) => return SourceResponse::with_error(err.to_string()),
        };
        for row in rows.flatten() {
            let (name, value) = row;
            match name.as_str() {
                "bounds" | "center" => {
                    if let Some(numbers) = parse_number_list(&value) {
                        document.insert(name, json!(numbers));
                    }
                }
                "minzoom" | "maxzoom" => {
                    if let Ok(zoom) = value.parse::<u8>() {
                        document.insert(name, json!(zoom));
                    }
                }
                "json" => {
                    // Extended metadata (vector_layers et al) stored as JSON.
                    if let Ok(Value::Object(extra)) = serde_json::from_str(&value) {
                        for (key, entry) in extra {
                            document.insert(key, entry);
                        }
                    }
                }
                _ => {
                    document.insert(name, Value::String(value));
                }
            }
        }
        match serde_json::to_vec(&Value::Object(document)) {
            Ok(data) => SourceResponse::with_data(data),
            Err(err) => SourceResponse::with_error(err.to_string()),
        }
    }
}

fn parse_number_list(value: &str) -> Option<Vec<f64>> {
    value
        .split(',')
        .map(|part| part.trim().parse::<f64>().ok())
        .collect()
}

/// Async facade over the global file-source pool.
pub struct FileSources {
    pool: Pool<FileSource>,
}

impl FileSources {
    pub async fn new() -> Result<Self, ServiceError> {
        let pool = Pool::new(0, 16, DEFAULT_IDLE_TIMEOUT, |ordinal| {
            Worker::spawn(format!("filesource-{ordinal}"), || Ok(FileSource::new()))
        })
        .await?;
        Ok(Self { pool })
    }

    pub async fn fetch_tile(
        &self,
        path: &Path,
        z: u8,
        x: u32,
        y: u32,
    ) -> Result<SourceResponse, ServiceError> {
        let worker = self.pool.acquire().await?;
        let path = path.to_path_buf();
        worker
            .submit(move |source: &mut FileSource| Ok(source.tile(&path, z, x, y)))
            .await
    }

    pub async fn fetch_source(&self, path: &Path) -> Result<SourceResponse, ServiceError> {
        let worker = self.pool.acquire().await?;
        let path = path.to_path_buf();
        worker
            .submit(move |source: &mut FileSource| Ok(source.source(&path)))
            .await
    }

    pub fn dispose(&self) {
        self.pool.dispose();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Creates a minimal MBTiles archive with the given tiles in XYZ
    /// addressing (rows are flipped on insert).
    pub(crate) fn write_mbtiles(
        path: &Path,
        metadata: &[(&str, &str)],
        tiles: &[(u8, u32, u32, Vec<u8>)],
    ) {
        let connection = Connection::open(path).unwrap();
        connection
            .execute_batch(
                "CREATE TABLE metadata (name TEXT, value TEXT); \
                 CREATE TABLE tiles (zoom_level INTEGER, tile_column INTEGER, \
                 tile_row INTEGER, tile_data BLOB);",
            )
            .unwrap();
        for (name, value) in metadata {
            connection
                .execute(
                    "INSERT INTO metadata (name, value) VALUES (?1, ?2)",
                    rusqlite::params![name, value],
                )
                .unwrap();
        }
        for (z, x, y, data) in tiles {
            let tms_row = (1u32 << z) - 1 - y;
            connection
                .execute(
                    "INSERT INTO tiles (zoom_level, tile_column, tile_row, tile_data) \
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![z, x, tms_row, data],
                )
                .unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fetches_tiles_and_reports_missing_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("world.mbtiles");
        write_mbtiles(
            &path,
            &[("name", "world"), ("format", "pbf")],
            &[(1, 0, 1, vec![1, 2, 3])],
        );

        let sources = FileSources::new().await.unwrap();
        let hit = sources.fetch_tile(&path, 1, 0, 1).await.unwrap();
        assert!(hit.error.is_none());
        assert!(!hit.no_content);
        assert_eq!(hit.data.unwrap(), vec![1, 2, 3]);

        let miss = sources.fetch_tile(&path, 1, 1, 0).await.unwrap();
        assert!(miss.error.is_none());
        assert!(miss.no_content);

        sources.dispose();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn builds_tilejson_shaped_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.mbtiles");
        write_mbtiles(
            &path,
            &[
                ("name", "osm"),
                ("format", "pbf"),
                ("bounds", "-10.5,-20, 10.5, 20"),
                ("minzoom", "2"),
                ("maxzoom", "9"),
                ("json", r#"{"vector_layers":[{"id":"water"}]}"#),
            ],
            &[],
        );

        let sources = FileSources::new().await.unwrap();
        let response = sources.fetch_source(&path).await.unwrap();
        let document: Value = serde_json::from_slice(&response.data.unwrap()).unwrap();
        assert_eq!(document["name"], "osm");
        assert_eq!(document["format"], "pbf");
        assert_eq!(document["bounds"], json!([-10.5, -20.0, 10.5, 20.0]));
        assert_eq!(document["minzoom"], 2);
        assert_eq!(document["maxzoom"], 9);
        assert_eq!(document["vector_layers"][0]["id"], "water");

        sources.dispose();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_archive_is_an_error() {
        let sources = FileSources::new().await.unwrap();
        let response = sources
            .fetch_tile(Path::new("/nonexistent/nope.mbtiles"), 0, 0, 0)
            .await
            .unwrap();
        assert!(response.error.is_some());
        sources.dispose();
    }
}
