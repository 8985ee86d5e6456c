//! Runs tile queries against the geometry store and classifies the outcome.
use crate::error::{Error, StoreErrorKind};
use crate::query::{QueryParam, TileQuery};
use crate::TileSource;

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, warn};

/// Outcome of a tile query. A zero-length tile is a valid result, not an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TileResult {
    pub bytes: Vec<u8>,
    pub is_empty: bool,
}

impl TileResult {
    pub fn empty() -> TileResult {
        TileResult {
            bytes: Vec::new(),
            is_empty: true,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> TileResult {
        let is_empty = bytes.is_empty();
        TileResult { bytes, is_empty }
    }
}

#[async_trait]
impl TileSource for PgPool {
    async fn render_mvt(&self, tile_query: &TileQuery) -> Result<Option<Vec<u8>>, sqlx::Error> {
        // The connection goes back to the pool when it drops, on every exit path.
        let mut conn = self.acquire().await?;

        let query = tile_query
            .params
            .iter()
            .fold(sqlx::query::<Postgres>(&tile_query.sql), |acc, param| match param {
                QueryParam::Float(value) => acc.bind(*value),
                QueryParam::Int(value) => acc.bind(*value),
                QueryParam::Text(value) => acc.bind(value.as_str()),
            });

        match query.fetch_optional(&mut *conn).await? {
            Some(row) => row.try_get::<Option<Vec<u8>>, _>(0),
            None => Ok(None),
        }
    }
}

/// Wraps a [`TileSource`] with a bounded execution time.
pub struct TileExecutor<S> {
    source: S,
    timeout: Duration,
}

impl<S: TileSource> TileExecutor<S> {
    pub fn new(source: S, timeout: Duration) -> TileExecutor<S> {
        TileExecutor { source, timeout }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub async fn execute(&self, query: &TileQuery) -> crate::Result<TileResult> {
        let rendered = tokio::time::timeout(self.timeout, self.source.render_mvt(query)).await;

        match rendered {
            Err(_) => {
                warn!(layer = %query.layer, timeout = ?self.timeout, "tile query timed out");
                Err(Error::Store {
                    kind: StoreErrorKind::Timeout,
                    message: format!(
                        "Tile query for layer {} timed out after {} ms",
                        query.layer,
                        self.timeout.as_millis()
                    ),
                })
            }
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(bytes)) => {
                let result = bytes.map(TileResult::from_bytes).unwrap_or_else(TileResult::empty);
                debug!(
                    layer = %query.layer,
                    bytes = result.bytes.len(),
                    empty = result.is_empty,
                    "tile query finished"
                );
                Ok(result)
            }
        }
    }
}
