//! GeoJSON codec: geometry primitives, features, and entity projection.
//!
//! Geometries are decoded into a tagged variant keyed on the `"type"`
//! discriminator; nothing downstream works on untyped maps.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{BrokerError, BrokerResult};
use crate::registry::Entity;

/// MIME type for GeoJSON request/response bodies.
pub const CONTENT_TYPE: &str = "application/geo+json";

/// A GeoJSON geometry, discriminated by its `"type"` member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point([f64; 2]),
    LineString(Vec<[f64; 2]>),
    Polygon(Vec<Vec<[f64; 2]>>),
    MultiPolygon(Vec<Vec<Vec<[f64; 2]>>>),
}

impl Geometry {
    pub fn from_json(bytes: &[u8]) -> BrokerResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| BrokerError::GeoJsonDecode(e.to_string()))
    }

    pub fn from_value(value: &Value) -> BrokerResult<Self> {
        serde_json::from_value(value.clone()).map_err(|e| BrokerError::GeoJsonDecode(e.to_string()))
    }

    pub fn geometry_type(&self) -> &'static str {
        match self {
            Geometry::Point(_) => "Point",
            Geometry::LineString(_) => "LineString",
            Geometry::Polygon(_) => "Polygon",
            Geometry::MultiPolygon(_) => "MultiPolygon",
        }
    }

    /// Extracts a representative `[lon, lat]` position.
    ///
    /// For a `Point` this is the coordinate pair itself; for a `MultiPolygon`
    /// the first vertex of the first ring of the first polygon. Other shapes
    /// yield the origin.
    pub fn point(&self) -> [f64; 2] {
        match self {
            Geometry::Point(position) => *position,
            Geometry::MultiPolygon(polygons) => polygons
                .first()
                .and_then(|rings| rings.first())
                .and_then(|ring| ring.first())
                .copied()
                .unwrap_or([0.0, 0.0]),
            _ => [0.0, 0.0],
        }
    }
}

/// A `GeoProperty` attribute whose value is a GeoJSON geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoJsonProperty {
    #[serde(rename = "type")]
    property_type: String,
    pub value: Geometry,
}

impl GeoJsonProperty {
    fn from_geometry(value: Geometry) -> Self {
        GeoJsonProperty {
            property_type: "GeoProperty".to_string(),
            value,
        }
    }

    /// Creates a Point property from a WGS84 position. The coordinate pair
    /// is stored in GeoJSON `[lon, lat]` order.
    pub fn from_wgs84(latitude: f64, longitude: f64) -> Self {
        Self::from_geometry(Geometry::Point([longitude, latitude]))
    }

    pub fn from_line_string(coordinates: Vec<[f64; 2]>) -> Self {
        Self::from_geometry(Geometry::LineString(coordinates))
    }

    pub fn from_multi_polygon(coordinates: Vec<Vec<Vec<[f64; 2]>>>) -> Self {
        Self::from_geometry(Geometry::MultiPolygon(coordinates))
    }

    pub fn from_json(bytes: &[u8]) -> BrokerResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| BrokerError::GeoJsonDecode(e.to_string()))
    }

    pub fn latitude(&self) -> f64 {
        self.value.point()[1]
    }

    pub fn longitude(&self) -> f64 {
        self.value.point()[0]
    }
}

/// A GeoJSON Feature wrapping a single entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    feature_type: String,
    pub geometry: Geometry,
    pub properties: Map<String, Value>,
}

impl Feature {
    pub fn new(id: impl Into<String>, geometry: Geometry, properties: Map<String, Value>) -> Self {
        Feature {
            id: id.into(),
            feature_type: "Feature".to_string(),
            geometry,
            properties,
        }
    }

    /// Folds the feature back into a lightweight entity envelope: the id and
    /// type are hoisted, the geometry becomes the `location` GeoProperty and
    /// the remaining properties are carried over unchanged.
    pub fn to_entity(&self) -> Entity {
        let mut entity = Map::new();

        let entity_type = self
            .properties
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| crate::registry::entity_type_from_urn(&self.id).map(str::to_string))
            .unwrap_or_default();

        entity.insert("id".to_string(), Value::String(self.id.clone()));
        entity.insert("type".to_string(), Value::String(entity_type));

        for (name, value) in &self.properties {
            if name != "id" && name != "type" {
                entity.insert(name.clone(), value.clone());
            }
        }

        entity.insert(
            "location".to_string(),
            json!({"type": "GeoProperty", "value": self.geometry}),
        );

        Value::Object(entity)
    }
}

/// A GeoJSON FeatureCollection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    collection_type: String,
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        FeatureCollection {
            collection_type: "FeatureCollection".to_string(),
            features,
        }
    }
}

impl Default for FeatureCollection {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Projects entities into GeoJSON features, with either the full NGSI-LD
/// property objects or the simplified key-value rendition.
#[derive(Debug, Clone)]
pub struct EntityFeatureProjector {
    location_property: String,
    simplified: bool,
}

impl EntityFeatureProjector {
    pub fn new(location_property: impl Into<String>, simplified: bool) -> Self {
        EntityFeatureProjector {
            location_property: location_property.into(),
            simplified,
        }
    }

    /// Projects a geometry-bearing entity into a Feature. An entity without
    /// the chosen location property is anchored at the origin.
    pub fn project(&self, entity: &Entity) -> BrokerResult<Feature> {
        let object = entity
            .as_object()
            .ok_or_else(|| BrokerError::GeoJsonDecode("entity is not a JSON object".to_string()))?;

        let geometry = match object.get(&self.location_property).and_then(|p| p.get("value")) {
            Some(value) => Geometry::from_value(value)?,
            None => Geometry::Point([0.0, 0.0]),
        };

        let id = object
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut properties = Map::new();
        for (name, value) in object {
            if name == "id" || name == "@context" {
                continue;
            }
            let projected = if self.simplified {
                simplify(value)
            } else {
                value.clone()
            };
            properties.insert(name.clone(), projected);
        }

        Ok(Feature::new(id, geometry, properties))
    }

    /// Projects an entity and appends the resulting Feature to `collection`.
    pub fn project_into(
        &self,
        entity: &Entity,
        collection: &mut FeatureCollection,
    ) -> BrokerResult<()> {
        let feature = self.project(entity)?;
        collection.features.push(feature);
        Ok(())
    }
}

/// Reduces an NGSI-LD attribute to its scalar leaf: the `.value` of a
/// Property or GeoProperty, the `.object` of a Relationship. Values that are
/// already leaves pass through unchanged, which makes the reduction
/// idempotent.
fn simplify(value: &Value) -> Value {
    if let Some(object) = value.as_object() {
        if let Some(leaf) = object.get("value") {
            return leaf.clone();
        }
        if let Some(leaf) = object.get("object") {
            return leaf.clone();
        }
    }
    value.clone()
}

/// Decodes `bytes` as either a single Feature or a FeatureCollection and
/// invokes `callback` once per feature.
pub fn unpack_geojson(
    bytes: &[u8],
    mut callback: impl FnMut(Feature) -> BrokerResult<()>,
) -> BrokerResult<()> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| BrokerError::GeoJsonDecode(e.to_string()))?;

    if value.get("features").is_some() {
        let collection: FeatureCollection = serde_json::from_value(value)
            .map_err(|e| BrokerError::GeoJsonDecode(e.to_string()))?;
        for feature in collection.features {
            callback(feature)?;
        }
    } else {
        let feature: Feature = serde_json::from_value(value)
            .map_err(|e| BrokerError::GeoJsonDecode(e.to_string()))?;
        callback(feature)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BEACH_FEATURE: &str = r#"{"id":"urn:ngsi-ld:Beach:42","type": "Feature",
        "geometry": {
            "type": "MultiPolygon",
            "coordinates": [[[
                [16.826877016818194,62.371366230256456],[16.82746858045308,62.37197792385098],
                [16.826075957396505,62.37229386059263],[16.825800236618605,62.37160561482045],
                [16.826877016818194,62.371366230256456]
                ]]]
        },
        "properties": {
          "description": "En fin liten strand.",
          "name": "Stranden",
          "refSeeAlso": ["urn:ngsi-ld:Device:tempsensor-19"],
          "type": "Beach"
        }}"#;

    #[test]
    fn wgs84_point_is_stored_in_lon_lat_order() {
        let lat = 65.2789;
        let lon = 17.2961;
        let prop = GeoJsonProperty::from_wgs84(lat, lon);

        assert_eq!(prop.value, Geometry::Point([lon, lat]));
        assert_eq!(prop.latitude(), lat);
        assert_eq!(prop.longitude(), lon);
    }

    #[test]
    fn line_string_round_trips_through_json() {
        let prop = GeoJsonProperty::from_line_string(vec![[12.0, 14.0], [13.0, 15.0]]);
        assert_eq!(prop.value.geometry_type(), "LineString");

        let bytes = serde_json::to_vec(&prop).unwrap();
        let decoded = GeoJsonProperty::from_json(&bytes).unwrap();
        assert_eq!(decoded.value.geometry_type(), "LineString");
        assert_eq!(decoded, prop);
    }

    #[test]
    fn multi_polygon_round_trips_and_extracts_first_vertex() {
        let prop = GeoJsonProperty::from_multi_polygon(vec![vec![vec![[12.0, 14.0], [13.0, 15.0]]]]);
        assert_eq!(prop.value.geometry_type(), "MultiPolygon");

        let bytes = serde_json::to_vec(&prop).unwrap();
        let decoded = GeoJsonProperty::from_json(&bytes).unwrap();
        assert_eq!(decoded.value.geometry_type(), "MultiPolygon");

        assert_eq!(decoded.latitude(), 14.0);
        assert_eq!(decoded.longitude(), 12.0);
    }

    #[test]
    fn unknown_geometry_type_fails_to_decode() {
        let err = Geometry::from_json(br#"{"type":"Circle","coordinates":[1.0,2.0]}"#).unwrap_err();
        assert!(matches!(err, BrokerError::GeoJsonDecode(_)));
    }

    #[test]
    fn geometry_json_uses_the_type_discriminator() {
        let value = serde_json::to_value(Geometry::Point([17.2961, 65.2789])).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "Point", "coordinates": [17.2961, 65.2789]})
        );
    }

    #[test]
    fn projection_keeps_full_property_objects() {
        let entity = serde_json::json!({
            "id": "urn:ngsi-ld:Beach:omaha",
            "type": "Beach",
            "name": {"type": "Property", "value": "Omaha Beach"},
            "location": {"type": "GeoProperty", "value": {"type": "Point", "coordinates": [17.2961, 65.2789]}},
            "@context": ["https://uri.etsi.org/ngsi-ld/v1/ngsi-ld-core-context.jsonld"]
        });

        let feature = EntityFeatureProjector::new("location", false)
            .project(&entity)
            .unwrap();

        assert_eq!(feature.id, "urn:ngsi-ld:Beach:omaha");
        assert_eq!(feature.geometry, Geometry::Point([17.2961, 65.2789]));
        assert_eq!(
            feature.properties["name"],
            serde_json::json!({"type": "Property", "value": "Omaha Beach"})
        );
        assert!(feature.properties.get("@context").is_none());
    }

    #[test]
    fn simplified_projection_flattens_to_scalar_leaves() {
        let entity = serde_json::json!({
            "id": "urn:ngsi-ld:Beach:omaha",
            "type": "Beach",
            "waterTemperature": {"type": "Property", "value": 7.2},
            "refDevice": {"type": "Relationship", "object": "urn:ngsi-ld:Device:d1"},
            "location": {"type": "GeoProperty", "value": {"type": "Point", "coordinates": [1.0, 2.0]}}
        });

        let feature = EntityFeatureProjector::new("location", true)
            .project(&entity)
            .unwrap();

        assert_eq!(feature.properties["waterTemperature"], serde_json::json!(7.2));
        assert_eq!(
            feature.properties["refDevice"],
            serde_json::json!("urn:ngsi-ld:Device:d1")
        );
        assert_eq!(feature.properties["type"], serde_json::json!("Beach"));
        assert_eq!(
            feature.properties["location"],
            serde_json::json!({"type": "Point", "coordinates": [1.0, 2.0]})
        );
    }

    #[test]
    fn simplification_is_idempotent() {
        let attribute = serde_json::json!({"type": "Property", "value": 7.2});
        let once = simplify(&attribute);
        let twice = simplify(&once);
        assert_eq!(once, twice);

        let scalar = serde_json::json!("already flat");
        assert_eq!(simplify(&scalar), scalar);
    }

    #[test]
    fn unpack_handles_a_single_feature() {
        let mut ids = Vec::new();
        unpack_geojson(BEACH_FEATURE.as_bytes(), |feature| {
            ids.push(feature.id.clone());
            Ok(())
        })
        .unwrap();

        assert_eq!(ids, vec!["urn:ngsi-ld:Beach:42"]);
    }

    #[test]
    fn unpack_handles_a_feature_collection() {
        let collection = format!(r#"{{"type": "FeatureCollection","features": [{BEACH_FEATURE}]}}"#);

        let mut count = 0;
        unpack_geojson(collection.as_bytes(), |_| {
            count += 1;
            Ok(())
        })
        .unwrap();

        assert_eq!(count, 1);
    }

    #[test]
    fn feature_folds_back_into_an_entity_envelope() {
        let mut entity = None;
        unpack_geojson(BEACH_FEATURE.as_bytes(), |feature| {
            entity = Some(feature.to_entity());
            Ok(())
        })
        .unwrap();

        let entity = entity.unwrap();
        assert_eq!(entity["id"], "urn:ngsi-ld:Beach:42");
        assert_eq!(entity["type"], "Beach");
        assert_eq!(entity["name"], "Stranden");
        assert_eq!(entity["location"]["type"], "GeoProperty");
        assert_eq!(entity["location"]["value"]["type"], "MultiPolygon");
    }
}
