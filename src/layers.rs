//! Vector tile layer definitions.
//!
//! Layers are described in YAML (see `layers.yml` at the crate root, which is compiled
//! into the binary). Each entry names the MVT layer, the relation and joins to read from,
//! the geometry column, the attributes to expose, and which request filters it accepts.
use crate::error::{Error, Result};
use crate::query::GEOMETRY_ALIAS;

use std::collections::HashSet;
use std::fmt;

use serde::Deserialize;

const BUILTIN_LAYERS: &str = include_str!("../layers.yml");

fn default_srid() -> i32 {
    4326
}

/// The four layers shipped with the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Layer {
    Polygons,
    States,
    Regions,
    Crops,
}

impl Layer {
    pub const ALL: [Layer; 4] = [Layer::Polygons, Layer::States, Layer::Regions, Layer::Crops];

    /// The MVT layer name this variant is registered under.
    pub fn id(&self) -> &'static str {
        match self {
            Layer::Polygons => "Polygons",
            Layer::States => "States",
            Layer::Regions => "Regions",
            Layer::Crops => "Crops",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Which runtime filters a layer accepts, and the columns they apply to.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(tag = "contract", rename_all = "snake_case")]
pub enum FilterContract {
    #[default]
    None,
    CropType {
        column: String,
    },
    StateAndCropType {
        column: String,
        state_table: String,
        state_key: String,
        state_geometry: String,
    },
}

impl FilterContract {
    /// Most path segments accepted after `<y>.pbf` for this contract, token included.
    pub fn max_path_segments(&self) -> usize {
        match self {
            FilterContract::None => 1,
            FilterContract::CropType { .. } => 2,
            FilterContract::StateAndCropType { .. } => 3,
        }
    }
}

/// An attribute projected into every feature of the layer.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AttributeColumn {
    /// Property name as it appears in the tile.
    pub name: String,
    /// SQL expression producing the value.
    pub expression: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LayerDescriptor {
    pub id: String,
    pub route: String,
    pub source: String,
    pub geometry: String,
    #[serde(default = "default_srid")]
    pub srid: i32,
    pub attributes: Vec<AttributeColumn>,
    #[serde(rename = "where", default)]
    pub base_filter: Option<String>,
    #[serde(default)]
    pub filter: FilterContract,
}

#[derive(Deserialize)]
struct LayerFile {
    layers: Vec<LayerDescriptor>,
}

/// The immutable set of layers the server knows about.
#[derive(Clone, Debug)]
pub struct LayerRegistry {
    layers: Vec<LayerDescriptor>,
}

impl LayerRegistry {
    /// Parses and validates a YAML layer definition document.
    pub fn from_yaml(data: &str) -> Result<LayerRegistry> {
        let file: LayerFile = serde_yaml::from_str(data)?;

        let mut routes = HashSet::new();
        for layer in file.layers.iter() {
            if layer.id.trim().is_empty() {
                return Err(Error::Config("layer id must not be empty".into()));
            }
            if layer.route.trim().is_empty() || layer.route.contains('/') {
                return Err(Error::Config(format!(
                    "layer {} has an invalid route '{}'",
                    layer.id, layer.route
                )));
            }
            if layer.geometry.trim().is_empty() || layer.source.trim().is_empty() {
                return Err(Error::Config(format!(
                    "layer {} needs both a source and a geometry column",
                    layer.id
                )));
            }
            if layer.attributes.is_empty() {
                return Err(Error::Config(format!(
                    "layer {} declares no attributes",
                    layer.id
                )));
            }
            if layer.attributes.iter().any(|a| a.name == GEOMETRY_ALIAS) {
                return Err(Error::Config(format!(
                    "layer {} uses the reserved attribute name '{}'",
                    layer.id, GEOMETRY_ALIAS
                )));
            }
            if layer.srid <= 0 {
                return Err(Error::Config(format!(
                    "layer {} has an invalid SRID {}",
                    layer.id, layer.srid
                )));
            }
            if !routes.insert(layer.route.as_str()) {
                return Err(Error::Config(format!(
                    "route '{}' is declared more than once",
                    layer.route
                )));
            }
        }

        Ok(LayerRegistry {
            layers: file.layers,
        })
    }

    /// The layer set compiled into the binary. All four [`Layer`] variants are present.
    pub fn builtin() -> Result<LayerRegistry> {
        let registry = LayerRegistry::from_yaml(BUILTIN_LAYERS)?;
        for layer in Layer::ALL {
            if registry.get(layer).is_none() {
                return Err(Error::Config(format!("built-in layer {} is missing", layer)));
            }
        }

        Ok(registry)
    }

    pub fn get(&self, layer: Layer) -> Option<&LayerDescriptor> {
        self.layers.iter().find(|l| l.id == layer.id())
    }

    pub fn by_route(&self, route: &str) -> Option<&LayerDescriptor> {
        self.layers.iter().find(|l| l.route == route)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LayerDescriptor> {
        self.layers.iter()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}
