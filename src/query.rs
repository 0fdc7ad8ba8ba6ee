//! NGSI-LD query model: URL-parameter parsing into an immutable [`Query`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, BrokerResult};
use crate::request::RequestWrapper;

/// Describes a relation as a max distance from a Point.
pub const GEO_SPATIAL_RELATION_NEAR_POINT: &str = "near";
/// Describes a relation as an overlapping polygon.
pub const GEO_SPATIAL_RELATION_WITHIN_RECT: &str = "within";

/// Pagination limit applied when the client does not supply one.
pub const DEFAULT_PAGINATION_LIMIT: u64 = 1000;

const REF_DEVICE_PREFIX: &str = "refDevice==\"";

/// A geospatial filter attached to an entity query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoQuery {
    pub geometry: String,
    pub coordinates: Vec<f64>,
    #[serde(rename = "georel")]
    pub geo_rel: String,
    #[serde(rename = "geoproperty", skip_serializing_if = "Option::is_none")]
    pub geo_property: Option<String>,

    #[serde(skip)]
    distance: u32,
}

impl GeoQuery {
    /// Required distance in metres from a `near` Point.
    pub fn distance(&self) -> u32 {
        self.distance
    }

    /// Extracts the position in the enclosed geometry.
    pub fn point(&self) -> BrokerResult<(f64, f64)> {
        if self.coordinates.len() == 2 {
            return Ok((self.coordinates[0], self.coordinates[1]));
        }

        Err(BrokerError::bad_parameter(
            "invalid number of coordinates in GeoQuery for a Point geometry",
        ))
    }

    /// Extracts the two opposing corners of the enclosed bounding rect.
    pub fn rectangle(&self) -> BrokerResult<(f64, f64, f64, f64)> {
        if self.coordinates.len() == 6 {
            // TODO: use all positions and allow for more elaborate polygons;
            // for now the first and third positions form the rect
            return Ok((
                self.coordinates[0],
                self.coordinates[1],
                self.coordinates[4],
                self.coordinates[5],
            ));
        }

        Err(BrokerError::bad_parameter(
            "invalid number of coordinates in GeoQuery for a Polygon geometry",
        ))
    }
}

/// Temporal relation kinds accepted in the `timerel` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRelation {
    /// observedAt >= timeAt
    After,
    /// observedAt < timeAt
    Before,
    /// timeAt <= observedAt < endTimeAt
    Between,
}

impl TimeRelation {
    fn parse(timerel: &str) -> Option<Self> {
        match timerel {
            "after" => Some(TimeRelation::After),
            "before" => Some(TimeRelation::Before),
            "between" => Some(TimeRelation::Between),
            _ => None,
        }
    }
}

/// A time-window filter on an entity's temporal property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporalQuery {
    timerel: TimeRelation,
    time_at: Option<DateTime<Utc>>,
    end_time_at: Option<DateTime<Utc>>,
    time_property: String,
}

impl TemporalQuery {
    pub fn relation(&self) -> TimeRelation {
        self.timerel
    }

    /// The temporal property the window applies to, `observedAt` by default.
    pub fn property(&self) -> &str {
        &self.time_property
    }

    /// Start and end of the window. `after` sets the start only, `before`
    /// the end only, `between` both.
    pub fn time_span(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        (self.time_at, self.end_time_at)
    }
}

/// An immutable NGSI-LD entity query, built once per request.
#[derive(Debug, Clone)]
pub struct Query {
    request: RequestWrapper,
    types: Vec<String>,
    attributes: Vec<String>,
    device: Option<String>,

    limit: u64,
    offset: u64,

    geo: Option<GeoQuery>,
    temporal: Option<TemporalQuery>,
}

impl Query {
    /// Builds a query from the request's URL parameters plus the already
    /// split type and attribute lists and the filter expression `q`.
    pub fn from_parameters(
        request: RequestWrapper,
        types: Vec<String>,
        attributes: Vec<String>,
        q: &str,
    ) -> BrokerResult<Self> {
        let params = parse_query_string(request.raw_query());

        let mut query = Query {
            request,
            types,
            attributes,
            device: None,
            limit: 0,
            offset: 0,
            geo: None,
            temporal: None,
        };

        if let Some(limitparam) = params.get("limit") {
            let limit: i64 = limitparam.parse().map_err(|_| {
                BrokerError::bad_parameter(format!(
                    "unable to parse limit parameter {limitparam} into an int value"
                ))
            })?;
            if limit < 0 {
                return Err(BrokerError::bad_parameter(
                    "limit parameter must not be negative",
                ));
            }
            query.limit = limit as u64;
        }

        if let Some(offsetparam) = params.get("offset") {
            let offset: i64 = offsetparam.parse().map_err(|_| {
                BrokerError::bad_parameter(format!(
                    "unable to parse offset parameter {offsetparam} into an int value"
                ))
            })?;
            if offset < 0 {
                return Err(BrokerError::bad_parameter(
                    "offset parameter must not be negative",
                ));
            }
            query.offset = offset as u64;
        }

        if q.starts_with(REF_DEVICE_PREFIX) {
            query.device = q.split('"').nth(1).map(str::to_string);
        }

        if let Some(georel) = params.get("georel") {
            if !georel.is_empty() {
                query.geo = Some(geo_query_from_parameters(georel, &params)?);
            }
        }

        if let Some(timerel) = params.get("timerel") {
            if !timerel.is_empty() {
                query.temporal = Some(temporal_query_from_parameters(timerel, &params)?);
            }
        }

        Ok(query)
    }

    pub fn has_device_reference(&self) -> bool {
        self.device.is_some()
    }

    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    /// Client-requested limit, or the default when zero or unspecified.
    pub fn pagination_limit(&self) -> u64 {
        if self.limit > 0 {
            self.limit
        } else {
            DEFAULT_PAGINATION_LIMIT
        }
    }

    pub fn pagination_offset(&self) -> u64 {
        self.offset
    }

    pub fn is_geo_query(&self) -> bool {
        self.geo.is_some()
    }

    pub fn geo(&self) -> Option<&GeoQuery> {
        self.geo.as_ref()
    }

    pub fn is_temporal_query(&self) -> bool {
        self.temporal.is_some()
    }

    pub fn temporal(&self) -> Option<&TemporalQuery> {
        self.temporal.as_ref()
    }

    pub fn entity_types(&self) -> &[String] {
        &self.types
    }

    pub fn entity_attributes(&self) -> &[String] {
        &self.attributes
    }

    /// The originating request; remote sources forward its method, path,
    /// query string and relevant headers.
    pub fn request(&self) -> &RequestWrapper {
        &self.request
    }
}

/// Decodes the raw query string into a parameter map. The first occurrence
/// of a key wins.
pub(crate) fn parse_query_string(raw_query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(raw_query.as_bytes()) {
        params.entry(key.into_owned()).or_insert(value.into_owned());
    }
    params
}

fn geo_query_from_parameters(
    georel: &str,
    params: &HashMap<String, String>,
) -> BrokerResult<GeoQuery> {
    // NGSI-LD packs near-relation modifiers into the georel value itself
    // (`near;maxDistance==2000`); a standalone maxDistance parameter is
    // accepted as well.
    let mut segments = georel.split(';');
    let relation = segments.next().unwrap_or_default();
    let inline_distance = segments
        .find_map(|segment| segment.strip_prefix("maxDistance="))
        .map(str::to_string);

    match relation {
        GEO_SPATIAL_RELATION_NEAR_POINT => {
            if params.get("geometry").map(String::as_str) != Some("Point") {
                return Err(BrokerError::bad_parameter(
                    "the geospatial relationship near is only defined for the geometry type Point",
                ));
            }

            let distance_string = params
                .get("maxDistance")
                .cloned()
                .or(inline_distance)
                .unwrap_or_default();

            // The doubled = is the NGSI-LD relation operator, so the value
            // seen here must itself start with a literal =.
            if distance_string.len() < 2 || !distance_string.starts_with('=') {
                return Err(BrokerError::bad_parameter(
                    "required parameter maxDistance missing or invalid",
                ));
            }

            let distance: i64 = distance_string[1..].parse().map_err(|e| {
                BrokerError::bad_parameter(format!("failed to parse distance: {e}"))
            })?;

            if distance < 0 {
                return Err(BrokerError::bad_parameter(
                    "distance value must be non negative",
                ));
            }

            let coordinates =
                parse_geometry_coordinates(params.get("coordinates").map(String::as_str).unwrap_or_default())?;

            if coordinates.len() != 2 {
                return Err(BrokerError::bad_parameter(format!(
                    "expected one position for a Point geometry, but got {}",
                    coordinates.len() / 2
                )));
            }

            Ok(GeoQuery {
                geometry: "Point".to_string(),
                coordinates,
                geo_rel: GEO_SPATIAL_RELATION_NEAR_POINT.to_string(),
                geo_property: params.get("geoproperty").cloned(),
                distance: distance as u32,
            })
        }
        GEO_SPATIAL_RELATION_WITHIN_RECT => {
            if params.get("geometry").map(String::as_str) != Some("Polygon") {
                return Err(BrokerError::bad_parameter(
                    "the geospatial relationship \"within\" is only defined for the geometry type Polygon",
                ));
            }

            let coordinates =
                parse_geometry_coordinates(params.get("coordinates").map(String::as_str).unwrap_or_default())?;

            if coordinates.len() != 6 {
                return Err(BrokerError::bad_parameter(format!(
                    "the geospatial relationship \"within\" is only implemented for the Polygon type with three positions describing a bounding rect, but {} positions were received",
                    coordinates.len() / 2
                )));
            }

            Ok(GeoQuery {
                geometry: "Polygon".to_string(),
                coordinates,
                geo_rel: GEO_SPATIAL_RELATION_WITHIN_RECT.to_string(),
                geo_property: params.get("geoproperty").cloned(),
                distance: 0,
            })
        }
        _ => Err(BrokerError::bad_parameter(
            "only the geo-spatial relationships \"near\" and \"within\" are supported at this time",
        )),
    }
}

fn temporal_query_from_parameters(
    timerel: &str,
    params: &HashMap<String, String>,
) -> BrokerResult<TemporalQuery> {
    let relation = TimeRelation::parse(timerel).ok_or_else(|| {
        BrokerError::bad_parameter(format!("temporal relation of type {timerel} not supported"))
    })?;

    let time_at_str = params
        .get("timeAt")
        .filter(|value| !value.is_empty())
        .ok_or_else(|| BrokerError::bad_parameter("missing parameter timeAt"))?;

    let time_at = DateTime::parse_from_rfc3339(time_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            BrokerError::bad_parameter(format!("failed to parse timeAt from {time_at_str}"))
        })?;

    let mut query = TemporalQuery {
        timerel: relation,
        time_at: None,
        end_time_at: None,
        time_property: "observedAt".to_string(),
    };

    // For a "before" relation the single timeAt parameter marks the end of
    // the span.
    if relation == TimeRelation::Before {
        query.end_time_at = Some(time_at);
    } else {
        query.time_at = Some(time_at);
    }

    if relation == TimeRelation::Between {
        let end_time_at_str = params
            .get("endTimeAt")
            .filter(|value| !value.is_empty())
            .ok_or_else(|| BrokerError::bad_parameter("missing parameter endTimeAt"))?;

        query.end_time_at = Some(
            DateTime::parse_from_rfc3339(end_time_at_str)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| {
                    BrokerError::bad_parameter(format!(
                        "failed to parse endTimeAt from {end_time_at_str}"
                    ))
                })?,
        );
    }

    if let Some(time_property) = params.get("timeproperty") {
        if !time_property.is_empty() {
            query.time_property = time_property.clone();
        }
    }

    Ok(query)
}

/// Parses a nested `[..]` coordinate array literal into a flat float
/// sequence in source order.
///
/// A small state machine over the ASCII bytes is used instead of a general
/// JSON parser to avoid allocation on hot paths. Whitespace is not expected
/// and not accepted.
pub fn parse_geometry_coordinates(coordparameter: &str) -> BrokerResult<Vec<f64>> {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Init,
        PreLon,
        LonInt,
        LonDec,
        PreLat,
        LatInt,
        LatDec,
    }

    let mut coordinates = Vec::new();
    let mut state = State::Init;

    let mut lon = 0.0;
    let mut intpart: i64 = 0;
    let mut decpart = 0.0;
    let mut decfactor = 1.0;

    let mut pdepth: i32 = 0;

    for (i, b) in coordparameter.bytes().enumerate() {
        if state == State::Init {
            if b != b'[' {
                return Err(BrokerError::bad_parameter(
                    "coordinates string must start with a [",
                ));
            }
            state = State::PreLon;
            pdepth += 1;
            continue;
        }

        match b {
            b'[' => {
                if state != State::PreLon {
                    return Err(BrokerError::bad_parameter(format!(
                        "unexpected [ at position {i} in {coordparameter}"
                    )));
                }
                pdepth += 1;
            }
            b']' => {
                pdepth -= 1;

                if pdepth < 0 {
                    return Err(BrokerError::bad_parameter(format!(
                        "unexpected ] at position {i} in {coordparameter}"
                    )));
                }

                if state == State::LatInt || state == State::LatDec {
                    let lat = intpart as f64 + decpart;
                    intpart = 0;
                    decpart = 0.0;
                    decfactor = 1.0;

                    coordinates.push(lon);
                    coordinates.push(lat);
                    state = State::PreLon;
                }

                if pdepth == 0 {
                    break;
                }
            }
            b'0'..=b'9' => {
                if state == State::PreLon {
                    state = State::LonInt;
                } else if state == State::PreLat {
                    state = State::LatInt;
                }

                if state == State::LatInt || state == State::LonInt {
                    intpart = intpart * 10 + i64::from(b - b'0');
                } else if state == State::LatDec || state == State::LonDec {
                    decfactor /= 10.0;
                    decpart += f64::from(b - b'0') * decfactor;
                }
            }
            b'.' => {
                if state == State::LatInt {
                    state = State::LatDec;
                } else if state == State::LonInt {
                    state = State::LonDec;
                }
            }
            b',' => {
                if state == State::LonInt || state == State::LonDec {
                    lon = intpart as f64 + decpart;
                    intpart = 0;
                    decpart = 0.0;
                    decfactor = 1.0;

                    state = State::PreLat;
                }
            }
            _ => {
                return Err(BrokerError::bad_parameter(format!(
                    "invalid byte '{}' found at position {i} in {coordparameter}",
                    b as char
                )));
            }
        }
    }

    if pdepth > 0 {
        return Err(BrokerError::bad_parameter(format!(
            "missing ] at end of coordinates array {coordparameter}"
        )));
    }

    Ok(coordinates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, Method, Uri};
    use bytes::Bytes;

    const DATE_TIME_AT: &str = "2017-12-13T14:20:00Z";
    const DATE_END_TIME_AT: &str = "2017-12-13T14:40:00Z";

    fn request(params: &str) -> RequestWrapper {
        let uri: Uri = format!("http://localhost:8080/ngsi-ld/v1/entities?{params}")
            .parse()
            .unwrap();
        RequestWrapper::new(Method::GET, &uri, HeaderMap::new(), Bytes::new())
    }

    fn query(params: &str) -> BrokerResult<Query> {
        Query::from_parameters(
            request(params),
            vec!["T".to_string()],
            vec!["a".to_string()],
            "",
        )
    }

    #[test]
    fn coordinate_parser_flattens_nested_pairs() {
        let coords = parse_geometry_coordinates("[[2.4,2.1],[3.3,3.7]]").unwrap();
        assert_eq!(coords, vec![2.4, 2.1, 3.3, 3.7]);
    }

    #[test]
    fn coordinate_parser_accepts_a_single_pair() {
        let coords = parse_geometry_coordinates("[8,40]").unwrap();
        assert_eq!(coords, vec![8.0, 40.0]);
    }

    #[test]
    fn coordinate_parser_matches_json_encoding_of_pair_lists() {
        let pairs = [[16.5, 62.4], [17.0, 63.0], [18.25, 64.125]];
        let encoded = serde_json::to_string(&pairs).unwrap();

        let coords = parse_geometry_coordinates(&encoded).unwrap();
        assert_eq!(coords, vec![16.5, 62.4, 17.0, 63.0, 18.25, 64.125]);
    }

    #[test]
    fn coordinate_parser_rejects_malformed_input() {
        assert!(parse_geometry_coordinates("2.4,2.1]").is_err());
        assert!(parse_geometry_coordinates("[[2.4,2.1],[3.3,3.7]").is_err());
        assert!(parse_geometry_coordinates("[[2.4,2.1],x]").is_err());
        assert!(parse_geometry_coordinates("[[2.4[,2.1]]").is_err());
    }

    #[test]
    fn limit_and_offset_are_parsed() {
        let q = query("limit=2&offset=5").unwrap();
        assert_eq!(q.pagination_limit(), 2);
        assert_eq!(q.pagination_offset(), 5);
    }

    #[test]
    fn pagination_defaults_apply() {
        let q = query("").unwrap();
        assert_eq!(q.pagination_limit(), DEFAULT_PAGINATION_LIMIT);
        assert_eq!(q.pagination_offset(), 0);
    }

    #[test]
    fn zero_limit_means_default_not_unlimited() {
        let q = query("limit=0").unwrap();
        assert_eq!(q.pagination_limit(), DEFAULT_PAGINATION_LIMIT);
    }

    #[test]
    fn negative_or_malformed_pagination_is_rejected() {
        assert!(query("limit=-1").is_err());
        assert!(query("offset=-3").is_err());
        assert!(query("limit=many").is_err());
    }

    #[test]
    fn device_reference_is_captured_from_q() {
        let device = "urn:ngsi-ld:Device:mydevice";
        let q = Query::from_parameters(
            request("attrs=snowHeight"),
            vec!["".to_string()],
            vec!["snowHeight".to_string()],
            &format!("refDevice==\"{device}\""),
        )
        .unwrap();

        assert!(q.has_device_reference());
        assert_eq!(q.device(), Some(device));
    }

    #[test]
    fn near_point_geo_query_is_parsed() {
        let q = query("georel=near&geometry=Point&maxDistance==2000&coordinates=[8,40]").unwrap();

        assert!(q.is_geo_query());
        let geo = q.geo().unwrap();
        assert_eq!(geo.geo_rel, "near");
        assert_eq!(geo.distance(), 2000);
        assert_eq!(geo.point().unwrap(), (8.0, 40.0));
    }

    #[test]
    fn near_point_accepts_the_combined_georel_form() {
        let q = query("georel=near%3BmaxDistance==2000&geometry=Point&coordinates=[8,40]").unwrap();

        let geo = q.geo().unwrap();
        assert_eq!(geo.geo_rel, "near");
        assert_eq!(geo.distance(), 2000);
    }

    #[test]
    fn near_requires_point_geometry_and_distance() {
        assert!(query("georel=near&geometry=Polygon&maxDistance==2000&coordinates=[8,40]").is_err());
        assert!(query("georel=near&geometry=Point&coordinates=[8,40]").is_err());
        // single = carries no distance value
        assert!(query("georel=near&geometry=Point&maxDistance=2000&coordinates=[8,40]").is_err());
        assert!(query("georel=near&geometry=Point&maxDistance==-5&coordinates=[8,40]").is_err());
        assert!(
            query("georel=near&geometry=Point&maxDistance==2000&coordinates=[[8,40],[9,41]]")
                .is_err()
        );
    }

    #[test]
    fn within_rect_geo_query_is_parsed() {
        let q =
            query("georel=within&geometry=Polygon&coordinates=[[8,40],[9,41],[10,42]]").unwrap();

        assert!(q.is_geo_query());
        let geo = q.geo().unwrap();
        assert_eq!(geo.geo_rel, "within");

        let (lon0, lat0, lon1, lat1) = geo.rectangle().unwrap();
        assert_eq!((lon0, lat0, lon1, lat1), (8.0, 40.0, 10.0, 42.0));
    }

    #[test]
    fn within_requires_three_positions() {
        assert!(query("georel=within&geometry=Polygon&coordinates=[[8,40],[9,41]]").is_err());
        assert!(query("georel=within&geometry=Point&coordinates=[[8,40],[9,41],[10,42]]").is_err());
    }

    #[test]
    fn unsupported_georel_is_rejected() {
        assert!(query("georel=overlaps&geometry=Polygon&coordinates=[[8,40]]").is_err());
    }

    #[test]
    fn temporal_query_after_time() {
        let q = query(&format!("timerel=after&timeAt={DATE_TIME_AT}")).unwrap();

        assert!(q.is_temporal_query());
        let temporal = q.temporal().unwrap();
        assert_eq!(temporal.relation(), TimeRelation::After);

        let (from, to) = temporal.time_span();
        assert_eq!(from, Some(DATE_TIME_AT.parse().unwrap()));
        assert_eq!(to, None);
    }

    #[test]
    fn temporal_query_after_time_ignores_end_time() {
        let q = query(&format!(
            "timerel=after&timeAt={DATE_TIME_AT}&endTimeAt={DATE_END_TIME_AT}"
        ))
        .unwrap();

        let (_, to) = q.temporal().unwrap().time_span();
        assert_eq!(to, None);
    }

    #[test]
    fn temporal_query_uses_default_time_property() {
        let q = query(&format!("timerel=after&timeAt={DATE_TIME_AT}")).unwrap();
        assert_eq!(q.temporal().unwrap().property(), "observedAt");
    }

    #[test]
    fn temporal_query_with_custom_time_property() {
        let q = query(&format!(
            "timerel=after&timeAt={DATE_TIME_AT}&timeproperty=modifiedAt"
        ))
        .unwrap();
        assert_eq!(q.temporal().unwrap().property(), "modifiedAt");
    }

    #[test]
    fn temporal_query_before_time_sets_the_end_of_the_span() {
        let q = query(&format!("timerel=before&timeAt={DATE_TIME_AT}")).unwrap();

        let (from, to) = q.temporal().unwrap().time_span();
        assert_eq!(from, None);
        assert_eq!(to, Some(DATE_TIME_AT.parse().unwrap()));
    }

    #[test]
    fn temporal_query_between_two_times() {
        let q = query(&format!(
            "timerel=between&timeAt={DATE_TIME_AT}&endTimeAt={DATE_END_TIME_AT}"
        ))
        .unwrap();

        let (from, to) = q.temporal().unwrap().time_span();
        assert_eq!(from, Some(DATE_TIME_AT.parse().unwrap()));
        assert_eq!(to, Some(DATE_END_TIME_AT.parse().unwrap()));
    }

    #[test]
    fn temporal_query_error_cases() {
        assert!(query("timerel=notsupported").is_err());
        assert!(query("timerel=after").is_err());
        assert!(query("timerel=after&timeAt=notparseable").is_err());
        assert!(query(&format!("timerel=between&timeAt={DATE_TIME_AT}")).is_err());
        assert!(query(&format!(
            "timerel=between&timeAt={DATE_TIME_AT}&endTimeAt=notparseable"
        ))
        .is_err());
    }
}
