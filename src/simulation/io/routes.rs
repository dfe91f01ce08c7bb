use std::path::Path;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::simulation::error::{IoError, SetupError};
use crate::simulation::id::Id;
use crate::simulation::io::read_json;
use crate::simulation::network::road_network::Edge;
use crate::simulation::time_queue::DueStep;
use crate::simulation::vehicles::{RouteLeg, Vehicle, VehicleType};

/// A scripted vehicle with a fixed route. Created on the worker owning its first edge once the
/// departure step is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRoute {
    pub id: Id<Vehicle>,
    pub vehicle_type: VehicleType,
    pub departure_step: u64,
    pub legs: Vec<RouteLeg>,
    /// Foreground vehicles are the ones reported when only those are requested.
    pub foreground: bool,
}

impl DueStep for ExternalRoute {
    fn due_step(&self) -> u64 {
        self.departure_step
    }
}

/// Route definitions as stored on disk. Edges are referenced by their ids in the network file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteFile {
    pub routes: Vec<RouteRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRecord {
    #[serde(default = "default_vehicle_type")]
    pub vehicle_type: VehicleType,
    /// Seconds after the start of the run.
    #[serde(default)]
    pub departure: f64,
    pub legs: Vec<LegRecord>,
    #[serde(default = "default_foreground")]
    pub foreground: bool,
}

/// Either a plain edge id or an edge with a stop of the given number of seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LegRecord {
    Edge(String),
    Stopover { edge: String, stopover: f64 },
}

impl LegRecord {
    fn edge(&self) -> &str {
        match self {
            LegRecord::Edge(edge) => edge,
            LegRecord::Stopover { edge, .. } => edge,
        }
    }
}

fn default_vehicle_type() -> VehicleType {
    VehicleType::Car
}

fn default_foreground() -> bool {
    true
}

impl RouteFile {
    pub fn from_file(path: &Path) -> Result<Self, IoError> {
        let file: RouteFile = read_json(path)?;
        info!("Read {} route definitions from {path:?}", file.routes.len());
        Ok(file)
    }

    /// Maps the edge ids of all routes onto the network. The position of a route in the file
    /// becomes the id of its vehicle.
    pub fn resolve(
        self,
        edge_ids: &AHashMap<String, Id<Edge>>,
        steps_per_second: u32,
    ) -> Result<Vec<ExternalRoute>, SetupError> {
        self.routes
            .into_iter()
            .enumerate()
            .map(|(index, record)| {
                if record.legs.is_empty() {
                    return Err(SetupError::EmptyRoute(index));
                }
                let legs = record
                    .legs
                    .iter()
                    .map(|leg| {
                        let edge = edge_ids.get(leg.edge()).copied().ok_or_else(|| {
                            SetupError::UnknownEdge {
                                route: index,
                                edge: leg.edge().to_string(),
                            }
                        })?;
                        Ok(match leg {
                            LegRecord::Edge(_) => RouteLeg::new(edge),
                            LegRecord::Stopover { stopover, .. } => {
                                RouteLeg::with_stopover(edge, *stopover)
                            }
                        })
                    })
                    .collect::<Result<Vec<_>, SetupError>>()?;
                Ok(ExternalRoute {
                    id: Id::new(index as u64),
                    vehicle_type: record.vehicle_type,
                    departure_step: (record.departure.max(0.) * steps_per_second as f64).round()
                        as u64,
                    legs,
                    foreground: record.foreground,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use ahash::AHashMap;

    use crate::simulation::error::SetupError;
    use crate::simulation::id::Id;
    use crate::simulation::io::routes::RouteFile;
    use crate::simulation::network::road_network::Edge;
    use crate::simulation::vehicles::VehicleType;

    fn edge_ids() -> AHashMap<String, Id<Edge>> {
        ["ab", "bc", "cd"]
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), Id::new(i as u64)))
            .collect()
    }

    #[test]
    fn resolve_routes() {
        let json = r#"{"routes": [
            {"vehicle_type": "Priority", "departure": 2.5, "legs": ["ab", "bc"]},
            {"legs": ["bc", {"edge": "cd", "stopover": 15}], "foreground": false}
        ]}"#;
        let file: RouteFile = serde_json::from_str(json).unwrap();
        let routes = file.resolve(&edge_ids(), 5).unwrap();

        assert_eq!(2, routes.len());
        assert_eq!(VehicleType::Priority, routes[0].vehicle_type);
        assert_eq!(13, routes[0].departure_step);
        assert!(routes[0].foreground);
        assert_eq!(Id::new(1), routes[1].id);
        assert_eq!(VehicleType::Car, routes[1].vehicle_type);
        assert_eq!(0, routes[1].departure_step);
        assert_eq!(Id::new(2), routes[1].legs[1].edge);
        assert_eq!(15., routes[1].legs[1].stopover);
        assert_eq!(0., routes[1].legs[0].stopover);
    }

    #[test]
    fn unknown_edge_fails_setup() {
        let json = r#"{"routes": [{"legs": ["ab", "zz"]}]}"#;
        let file: RouteFile = serde_json::from_str(json).unwrap();
        assert!(matches!(
            file.resolve(&edge_ids(), 5),
            Err(SetupError::UnknownEdge { route: 0, .. })
        ));
    }

    #[test]
    fn empty_route_fails_setup() {
        let json = r#"{"routes": [{"legs": []}]}"#;
        let file: RouteFile = serde_json::from_str(json).unwrap();
        assert!(matches!(
            file.resolve(&edge_ids(), 5),
            Err(SetupError::EmptyRoute(0))
        ));
    }
}
