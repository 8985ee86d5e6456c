//! Builds the parameterized `ST_AsMVT` statement for a layer and tile.
//!
//! Every request value (the tile envelope, state id and crop type id) travels as a bound
//! parameter. Only static layer configuration is ever written into the SQL text.
use crate::error::{Error, Result};
use crate::layers::{FilterContract, LayerDescriptor};
use crate::BoundingBox;

/// Tile extent in MVT coordinate units.
pub const EXTENT: u32 = 4096;
/// Buffer around the tile, in MVT coordinate units, kept when clipping.
pub const BUFFER: u32 = 256;
/// Whether geometries are clipped to the buffered tile.
pub const CLIP_GEOMETRY: bool = true;
/// SRID of the bound tile envelope.
pub const WGS84_SRID: i32 = 4326;
/// Column name holding the tile-space geometry inside the encoded rows.
pub const GEOMETRY_ALIAS: &str = "geom";

const STATE_INVALID: &str = "The id of the state is invalid";
const CROP_TYPE_INVALID: &str = "The id of the crop type is invalid";

/// A value bound to a `$n` placeholder.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryParam {
    Float(f64),
    Int(i64),
    Text(String),
}

/// A ready-to-run tile query: SQL text plus its parameters in placeholder order.
#[derive(Clone, Debug, PartialEq)]
pub struct TileQuery {
    pub layer: String,
    pub sql: String,
    pub params: Vec<QueryParam>,
}

/// Crop type selection. `-` in a request path means every crop type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CropTypeFilter {
    Any,
    Id(i64),
}

impl CropTypeFilter {
    pub const WILDCARD: &'static str = "-";

    pub fn parse(value: &str) -> Result<CropTypeFilter> {
        let value = value.trim();
        if value == Self::WILDCARD {
            return Ok(CropTypeFilter::Any);
        }

        value
            .parse::<i64>()
            .map(CropTypeFilter::Id)
            .map_err(|_| Error::InvalidFilter(CROP_TYPE_INVALID.into()))
    }
}

/// Raw filter values taken from a request. Validation against the layer's contract
/// happens in [`build`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterParameters {
    pub crop_type: Option<String>,
    pub state_id: Option<String>,
}

impl FilterParameters {
    /// Empty strings count as absent.
    pub fn new(crop_type: Option<&str>, state_id: Option<&str>) -> FilterParameters {
        let present = |v: Option<&str>| v.filter(|s| !s.trim().is_empty()).map(String::from);
        FilterParameters {
            crop_type: present(crop_type),
            state_id: present(state_id),
        }
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn quote_identifier(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn crop_type_predicate(
    column: &str,
    filters: &FilterParameters,
    params: &mut Vec<QueryParam>,
) -> Result<Option<String>> {
    let raw = filters
        .crop_type
        .as_deref()
        .ok_or_else(|| Error::InvalidFilter(CROP_TYPE_INVALID.into()))?;

    match CropTypeFilter::parse(raw)? {
        CropTypeFilter::Any => Ok(None),
        CropTypeFilter::Id(id) => {
            params.push(QueryParam::Int(id));
            Ok(Some(format!("{} = ${}", column, params.len())))
        }
    }
}

/// Composes the tile query for `layer` over `bbox`, applying the layer's filter contract.
pub fn build(
    layer: &LayerDescriptor,
    bbox: &BoundingBox,
    filters: &FilterParameters,
) -> Result<TileQuery> {
    let mut params = vec![
        QueryParam::Float(bbox.min_x),
        QueryParam::Float(bbox.min_y),
        QueryParam::Float(bbox.max_x),
        QueryParam::Float(bbox.max_y),
    ];

    let mut predicates: Vec<String> = layer
        .base_filter
        .iter()
        .map(|p| format!("({})", p))
        .collect();

    match &layer.filter {
        FilterContract::None => {}
        FilterContract::CropType { column } => {
            predicates.extend(crop_type_predicate(column, filters, &mut params)?);
        }
        FilterContract::StateAndCropType {
            column,
            state_table,
            state_key,
            state_geometry,
        } => {
            let state_id = filters
                .state_id
                .as_deref()
                .ok_or_else(|| Error::InvalidFilter(STATE_INVALID.into()))?;
            params.push(QueryParam::Text(state_id.to_owned()));
            predicates.push(format!(
                "ST_Intersects({}, (SELECT s.{} FROM {} s WHERE s.{} = ${}))",
                layer.geometry,
                state_geometry,
                state_table,
                state_key,
                params.len()
            ));

            predicates.extend(crop_type_predicate(column, filters, &mut params)?);
        }
    }

    let attributes: Vec<String> = layer
        .attributes
        .iter()
        .map(|a| format!("{} AS {}", a.expression, quote_identifier(&a.name)))
        .collect();

    let mut envelope = format!("ST_MakeEnvelope($1, $2, $3, $4, {})", WGS84_SRID);
    if layer.srid != WGS84_SRID {
        envelope = format!("ST_Transform({}, {})", envelope, layer.srid);
    }
    let geom = format!(
        "ST_AsMVTGeom({}, {}, {}, {}, {})",
        layer.geometry, envelope, EXTENT, BUFFER, CLIP_GEOMETRY
    );

    let where_clause = if predicates.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", predicates.join(" AND "))
    };

    let sql = format!(
        "SELECT ST_AsMVT(q, {}, {}, '{}') FROM (SELECT {}, {} AS {} FROM {}{}) AS q WHERE q.{} IS NOT NULL",
        quote_literal(&layer.id),
        EXTENT,
        GEOMETRY_ALIAS,
        attributes.join(", "),
        geom,
        GEOMETRY_ALIAS,
        layer.source,
        where_clause,
        GEOMETRY_ALIAS
    );

    Ok(TileQuery {
        layer: layer.id.clone(),
        sql,
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Layer, LayerRegistry};
    use crate::get_tile_bounds;

    fn registry() -> LayerRegistry {
        LayerRegistry::builtin().unwrap()
    }

    fn bbox() -> BoundingBox {
        get_tile_bounds(10, 512, 341).unwrap()
    }

    #[test]
    fn test_parse_crop_type() {
        assert_eq!(CropTypeFilter::Any, CropTypeFilter::parse("-").unwrap());
        assert_eq!(CropTypeFilter::Id(5), CropTypeFilter::parse("5").unwrap());
        assert!(matches!(
            CropTypeFilter::parse("5 OR 1=1"),
            Err(Error::InvalidFilter(_))
        ));
    }

    #[test]
    fn test_empty_segments_are_absent() {
        let filters = FilterParameters::new(Some(""), Some("  "));
        assert_eq!(FilterParameters::default(), filters);
    }

    #[test]
    fn test_polygons_wildcard_has_no_crop_predicate() {
        let registry = registry();
        let layer = registry.get(Layer::Polygons).unwrap();
        let query = build(layer, &bbox(), &FilterParameters::new(Some("-"), None)).unwrap();

        assert_eq!("Polygons", query.layer);
        assert_eq!(4, query.params.len());
        assert!(!query.sql.contains("species_dictionary.\"id\" ="));
        assert!(!query.sql.contains("$5"));
        assert!(query.sql.starts_with("SELECT ST_AsMVT(q, 'Polygons', 4096, 'geom')"));
    }

    #[test]
    fn test_polygons_crop_type_is_bound() {
        let registry = registry();
        let layer = registry.get(Layer::Polygons).unwrap();
        let query = build(layer, &bbox(), &FilterParameters::new(Some("5"), None)).unwrap();

        assert_eq!(5, query.params.len());
        assert_eq!(QueryParam::Int(5), query.params[4]);
        assert!(query.sql.contains("WHERE species_dictionary.\"id\" = $5"));
    }

    #[test]
    fn test_polygons_require_crop_type() {
        let registry = registry();
        let layer = registry.get(Layer::Polygons).unwrap();
        let err = build(layer, &bbox(), &FilterParameters::default()).unwrap_err();
        assert!(err.to_string().contains("crop type"));
    }

    #[test]
    fn test_envelope_is_bound_in_order() {
        let registry = registry();
        let layer = registry.get(Layer::States).unwrap();
        let bbox = bbox();
        let query = build(layer, &bbox, &FilterParameters::default()).unwrap();

        assert_eq!(
            vec![
                QueryParam::Float(bbox.min_x),
                QueryParam::Float(bbox.min_y),
                QueryParam::Float(bbox.max_x),
                QueryParam::Float(bbox.max_y),
            ],
            query.params
        );
        assert!(query
            .sql
            .contains("ST_AsMVTGeom(R.geom, ST_MakeEnvelope($1, $2, $3, $4, 4326), 4096, 256, true)"));
        assert!(query.sql.contains("WHERE (R.region_id LIKE '%AGMXST%')"));
    }

    #[test]
    fn test_envelope_follows_layer_srid() {
        let yaml = r#"
layers:
  - id: Fields
    route: fields
    source: fields f
    geometry: f.geom
    srid: 3857
    attributes:
      - {name: id, expression: f.id}
"#;
        let registry = LayerRegistry::from_yaml(yaml).unwrap();
        let layer = registry.by_route("fields").unwrap();
        let bbox = bbox();
        let query = build(layer, &bbox, &FilterParameters::default()).unwrap();

        assert!(query.sql.contains(
            "ST_AsMVTGeom(f.geom, ST_Transform(ST_MakeEnvelope($1, $2, $3, $4, 4326), 3857), 4096, 256, true)"
        ));
        assert_eq!(QueryParam::Float(bbox.min_x), query.params[0]);
        assert_eq!(QueryParam::Float(bbox.max_y), query.params[3]);
    }

    #[test]
    fn test_encoding_constants_shared_by_all_layers() {
        let registry = registry();
        let filters = FilterParameters::new(Some("-"), Some("MX16"));
        for layer in registry.iter() {
            let query = build(layer, &bbox(), &filters).unwrap();
            assert!(query.sql.contains(", 4096, 256, true)"), "{}", layer.id);
            assert!(query
                .sql
                .contains(&format!("ST_AsMVT(q, '{}', 4096, 'geom')", layer.id)));
        }
    }

    #[test]
    fn test_attributes_projected_in_order() {
        let registry = registry();
        let layer = registry.get(Layer::Crops).unwrap();
        let query = build(layer, &bbox(), &FilterParameters::new(Some("-"), Some("MX16"))).unwrap();

        let positions: Vec<usize> = ["\"id\"", "\"name\"", "\"area\"", "\"specie_id\"", "\"specie_name\""]
            .iter()
            .map(|name| query.sql.find(&format!("AS {}", name)).unwrap())
            .collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, positions);
        assert!(query.sql.contains("INNER JOIN variety_types_dictionary"));
    }

    #[test]
    fn test_crops_state_and_crop_type() {
        let registry = registry();
        let layer = registry.get(Layer::Crops).unwrap();
        let query = build(layer, &bbox(), &FilterParameters::new(Some("7"), Some("MX16"))).unwrap();

        assert_eq!(QueryParam::Text("MX16".into()), query.params[4]);
        assert_eq!(QueryParam::Int(7), query.params[5]);
        assert!(query.sql.contains(
            "ST_Intersects(P.poligon, (SELECT s.geom FROM regions s WHERE s.region_id = $5)) AND species_dictionary.\"id\" = $6"
        ));
    }

    #[test]
    fn test_crops_wildcard_keeps_state_predicate() {
        let registry = registry();
        let layer = registry.get(Layer::Crops).unwrap();
        let query = build(layer, &bbox(), &FilterParameters::new(Some("-"), Some("MX16"))).unwrap();

        assert_eq!(5, query.params.len());
        assert!(query.sql.contains("ST_Intersects("));
        assert!(!query.sql.contains("$6"));
    }

    #[test]
    fn test_crops_missing_state_is_reported_first() {
        let registry = registry();
        let layer = registry.get(Layer::Crops).unwrap();

        let err = build(layer, &bbox(), &FilterParameters::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidFilter(_)));
        assert!(err.to_string().contains("state"));

        let err = build(layer, &bbox(), &FilterParameters::new(None, Some("MX16"))).unwrap_err();
        assert!(err.to_string().contains("crop type"));
    }

    #[test]
    fn test_filter_values_never_reach_sql_text() {
        let registry = registry();
        let layer = registry.get(Layer::Crops).unwrap();
        let hostile = "MX16'); DROP TABLE plot; --";
        let query = build(layer, &bbox(), &FilterParameters::new(Some("-"), Some(hostile))).unwrap();

        assert!(!query.sql.contains("DROP TABLE"));
        assert_eq!(QueryParam::Text(hostile.into()), query.params[4]);
    }

    #[test]
    fn test_layer_name_is_quoted() {
        let yaml = r#"
layers:
  - id: "O'Brien fields"
    route: obrien
    source: fields f
    geometry: f.geom
    attributes:
      - {name: 'the "id"', expression: f.id}
"#;
        let registry = LayerRegistry::from_yaml(yaml).unwrap();
        let layer = registry.by_route("obrien").unwrap();
        let query = build(layer, &bbox(), &FilterParameters::default()).unwrap();

        assert!(query.sql.contains("ST_AsMVT(q, 'O''Brien fields', 4096, 'geom')"));
        assert!(query.sql.contains("f.id AS \"the \"\"id\"\"\""));
        assert!(query.sql.ends_with("FROM fields f) AS q WHERE q.geom IS NOT NULL"));
    }
}
