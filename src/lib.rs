//! # Crop Tiles
//!
//! Serves Mapbox Vector Tiles for crop plots and administrative regions, rendered on
//! demand by PostGIS.
//!
//! ## Current features
//!
//! Given a PostGIS database holding plots, crops and region boundaries, this crate
//! turns an XYZ tile request into a single parameterized `ST_AsMVT` query and hands
//! the resulting bytes back verbatim. Four layers ship by default (plots filtered by
//! crop type, state boundaries, region boundaries, and crops filtered by state and
//! crop type). They are described in YAML, so the set can be replaced at startup.
//!
//! ## Known Limitations
//!
//! The tile envelope is always computed in EPSG:4326 and transformed to a layer's
//! declared SRID in SQL. Tiles are not cached server side, only a `Cache-Control`
//! header is emitted.

#![deny(warnings)]

use async_trait::async_trait;

pub mod config;
pub mod error;
pub mod executor;
pub mod layers;
pub mod query;
pub mod server;

pub use error::{Error, Result, StoreErrorKind};
pub use executor::{TileExecutor, TileResult};
pub use layers::{FilterContract, Layer, LayerDescriptor, LayerRegistry};
pub use query::{CropTypeFilter, FilterParameters, QueryParam, TileQuery};

/// Deepest zoom level accepted. Keeps `2^zoom` and `column + 1` inside `u32`.
pub const MAX_ZOOM: u8 = 30;

/// The geometry store seam. It is presently rather barebones: it receives a fully
/// built query and returns the single `bytea` cell it produces, if any.
#[async_trait]
pub trait TileSource: Send + Sync {
    /// Runs a tile query and returns the encoded tile, `None` when no row came back.
    async fn render_mvt(&self, query: &TileQuery) -> std::result::Result<Option<Vec<u8>>, sqlx::Error>;
}

/// A slippy map tile address in the XYZ scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileCoordinate {
    pub zoom: u8,
    pub column: u32,
    pub row: u32,
}

impl TileCoordinate {
    /// Validates that the column and row fall inside the `2^zoom` grid.
    pub fn new(zoom: u8, column: u32, row: u32) -> Result<TileCoordinate> {
        if zoom > MAX_ZOOM {
            return Err(Error::InvalidCoordinate(format!(
                "zoom {} exceeds the maximum of {}",
                zoom, MAX_ZOOM
            )));
        }

        let tiles_per_side = 1u32 << zoom;
        if column >= tiles_per_side || row >= tiles_per_side {
            return Err(Error::InvalidCoordinate(format!(
                "{}/{}/{} is outside the {}x{} grid",
                zoom, column, row, tiles_per_side, tiles_per_side
            )));
        }

        Ok(TileCoordinate { zoom, column, row })
    }

    /// Geographic extent covered by this tile.
    pub fn bounds(&self) -> BoundingBox {
        let (west, north) = slippy_map_tilenames::tile2lonlat(self.column, self.row, self.zoom);
        let (east, south) =
            slippy_map_tilenames::tile2lonlat(self.column + 1, self.row + 1, self.zoom);

        BoundingBox {
            min_x: west,
            min_y: south,
            max_x: east,
            max_y: north,
        }
    }
}

impl std::fmt::Display for TileCoordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.column, self.row)
    }
}

/// Longitude/latitude extent of a tile, in the order `ST_MakeEnvelope` expects.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

/// Converts an XYZ tile address into its WGS84 bounding box.
pub fn get_tile_bounds(zoom: u8, column: u32, row: u32) -> Result<BoundingBox> {
    Ok(TileCoordinate::new(zoom, column, row)?.bounds())
}
