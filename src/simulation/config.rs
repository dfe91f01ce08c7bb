use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::simulation::error::ConfigError;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct CommandLineArgs {
    #[arg(long, short)]
    pub config: String,
    #[arg(long, short)]
    pub network: String,
    #[arg(long, short)]
    pub routes: Option<String>,
    #[arg(long)]
    pub num_workers: Option<u32>,
    #[arg(long = "set", value_parser = parse_key_val)]
    pub overrides: Vec<(String, String)>,
}

impl CommandLineArgs {
    pub fn new_with_paths(config: impl ToString, network: impl ToString) -> Self {
        CommandLineArgs {
            config: config.to_string(),
            network: network.to_string(),
            routes: None,
            num_workers: None,
            overrides: Vec::new(),
        }
    }
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.find('=') {
        Some(pos) => Ok((s[..pos].to_string(), s[pos + 1..].to_string())),
        None => Err(format!("invalid KEY=VALUE: no `=` found in `{}`", s)),
    }
}

/// Immutable configuration of one simulation environment. It is read once, shared behind an
/// `Arc` and sent to the workers with the setup record. Changing it means setting up a new
/// environment.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub partitioning: Partitioning,
    #[serde(default)]
    pub simulation: Simulation,
    #[serde(default)]
    pub routing: Routing,
    #[serde(default)]
    pub reroute: Reroute,
    #[serde(default)]
    pub lights: Lights,
    #[serde(default)]
    pub vehicles: Vehicles,
    #[serde(default)]
    pub output: Output,
    #[serde(skip)]
    context: Option<PathBuf>,
}

impl TryFrom<CommandLineArgs> for Config {
    type Error = ConfigError;

    fn try_from(args: CommandLineArgs) -> Result<Self, Self::Error> {
        let mut config = Config::from_file(Path::new(&args.config))?;
        config.apply_overrides(&args.overrides);
        if let Some(num_workers) = args.num_workers {
            config.partitioning.num_workers = num_workers;
        }
        Ok(config)
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config =
            serde_yaml::from_reader(BufReader::new(file)).map_err(|source| {
                ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
        config.context = Some(path.to_path_buf());
        Ok(config)
    }

    /// The file this config was read from. Relative paths inside the config are resolved against it.
    pub fn context(&self) -> &Option<PathBuf> {
        &self.context
    }

    /// Duration of one step in seconds.
    pub fn step_size(&self) -> f64 {
        1. / self.simulation.steps_per_second as f64
    }

    /// Applies key-value overrides from the command line, e.g. partitioning.num_workers=4
    pub fn apply_overrides(&mut self, overrides: &[(String, String)]) {
        if !overrides.is_empty() {
            info!("Applying overrides: {:?}", overrides);
        }

        for (key, value) in overrides {
            let applied = match key.as_str() {
                "partitioning.num_workers" => parse_into(value, &mut self.partitioning.num_workers),
                "partitioning.max_cell_size" => {
                    parse_into(value, &mut self.partitioning.max_cell_size)
                }
                "simulation.max_num_steps" => parse_into(value, &mut self.simulation.max_num_steps),
                "simulation.seed" => parse_into(value, &mut self.simulation.seed),
                "simulation.sync" => match value.to_lowercase().as_str() {
                    "bsp" => {
                        self.simulation.sync = SyncMode::Bsp;
                        true
                    }
                    "psp" => {
                        self.simulation.sync = SyncMode::Psp;
                        true
                    }
                    _ => false,
                },
                "vehicles.num_private" => parse_into(value, &mut self.vehicles.num_private),
                "output.output_dir" => {
                    self.output.output_dir = PathBuf::from(value);
                    true
                }
                _ => false,
            };
            if !applied {
                warn!("Could not apply override {key}={value}");
            }
        }
    }
}

fn parse_into<T: std::str::FromStr>(value: &str, target: &mut T) -> bool {
    match value.parse() {
        Ok(v) => {
            *target = v;
            true
        }
        Err(_) => false,
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Partitioning {
    #[serde(default = "default_to_1")]
    pub num_workers: u32,
    #[serde(default)]
    pub method: PartitionMethod,
    /// Maximum edge length of a grid cell in meters.
    #[serde(default = "default_cell_size")]
    pub max_cell_size: f64,
}

impl Default for Partitioning {
    fn default() -> Self {
        Partitioning {
            num_workers: 1,
            method: PartitionMethod::LaneLength,
            max_cell_size: default_cell_size(),
        }
    }
}

#[derive(PartialEq, Debug, ValueEnum, Clone, Copy, Serialize, Deserialize, Default)]
pub enum PartitionMethod {
    #[default]
    LaneLength,
    Metis,
}

#[derive(PartialEq, Debug, ValueEnum, Clone, Copy, Serialize, Deserialize, Default)]
pub enum SyncMode {
    #[default]
    Bsp,
    Psp,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Simulation {
    #[serde(default = "default_steps_per_second")]
    pub steps_per_second: u32,
    #[serde(default = "default_max_num_steps")]
    pub max_num_steps: u64,
    #[serde(default = "default_look_ahead")]
    pub look_ahead_distance: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub drive_on_left: bool,
    #[serde(default)]
    pub sync: SyncMode,
    #[serde(default)]
    pub step_pause_millis: u64,
    #[serde(default = "default_min_safety_gap")]
    pub min_safety_gap: f64,
    /// Seconds a vehicle on a conflicting approach must be away from an intersection for it to be crossed.
    #[serde(default = "default_safe_crossing_time")]
    pub min_safe_crossing_time: f64,
    #[serde(default = "default_jam_speed")]
    pub jam_speed: f64,
    #[serde(default = "default_priority_lane_distance")]
    pub priority_lane_distance: f64,
    #[serde(default = "default_detection_range")]
    pub detection_range: f64,
    #[serde(default = "default_turn_speed")]
    pub turn_speed: f64,
    #[serde(default = "default_true")]
    pub tram_yielding: bool,
    #[serde(default = "default_tram_stop_seconds")]
    pub tram_stop_seconds: f64,
    #[serde(default = "default_bus_stop_seconds")]
    pub bus_stop_seconds: f64,
    #[serde(default = "default_new_vehicles_per_step")]
    pub max_new_vehicles_per_step: u32,
}

impl Default for Simulation {
    fn default() -> Self {
        Simulation {
            steps_per_second: default_steps_per_second(),
            max_num_steps: default_max_num_steps(),
            look_ahead_distance: default_look_ahead(),
            seed: default_seed(),
            drive_on_left: false,
            sync: SyncMode::Bsp,
            step_pause_millis: 0,
            min_safety_gap: default_min_safety_gap(),
            min_safe_crossing_time: default_safe_crossing_time(),
            jam_speed: default_jam_speed(),
            priority_lane_distance: default_priority_lane_distance(),
            detection_range: default_detection_range(),
            turn_speed: default_turn_speed(),
            tram_yielding: true,
            tram_stop_seconds: default_tram_stop_seconds(),
            bus_stop_seconds: default_bus_stop_seconds(),
            max_new_vehicles_per_step: default_new_vehicles_per_step(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Routing {
    #[serde(default)]
    pub algorithm: RoutingAlgorithm,
    /// Priority vehicles may use tram tracks.
    #[serde(default)]
    pub priority_uses_tram_track: bool,
}

#[derive(PartialEq, Debug, ValueEnum, Clone, Copy, Serialize, Deserialize, Default)]
pub enum RoutingAlgorithm {
    #[default]
    Dijkstra,
    AStar,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Reroute {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_to_3")]
    pub max_num_reroute: u32,
}

impl Default for Reroute {
    fn default() -> Self {
        Reroute {
            enabled: true,
            max_num_reroute: 3,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Lights {
    #[serde(default)]
    pub timing: LightTiming,
    #[serde(default = "default_green")]
    pub green_seconds: f64,
    #[serde(default = "default_yellow")]
    pub yellow_seconds: f64,
    #[serde(default = "default_red")]
    pub red_seconds: f64,
    #[serde(default = "default_max_green")]
    pub max_green_seconds: f64,
    /// Signals connected by an edge up to this length form one light group.
    #[serde(default = "default_group_radius")]
    pub group_radius: f64,
}

impl Default for Lights {
    fn default() -> Self {
        Lights {
            timing: LightTiming::Fixed,
            green_seconds: default_green(),
            yellow_seconds: default_yellow(),
            red_seconds: default_red(),
            max_green_seconds: default_max_green(),
            group_radius: default_group_radius(),
        }
    }
}

#[derive(PartialEq, Debug, ValueEnum, Clone, Copy, Serialize, Deserialize, Default)]
pub enum LightTiming {
    #[default]
    Fixed,
    Dynamic,
}

/// Inclusive window of grid cells.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct GridWindow {
    pub min_row: u32,
    pub min_col: u32,
    pub max_row: u32,
    pub max_col: u32,
}

impl GridWindow {
    pub fn contains(&self, row: u32, col: u32) -> bool {
        (self.min_row..=self.max_row).contains(&row) && (self.min_col..=self.max_col).contains(&col)
    }
}

/// Targets for randomly generated background traffic.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Vehicles {
    #[serde(default)]
    pub num_private: u32,
    #[serde(default)]
    pub num_trams: u32,
    #[serde(default)]
    pub num_buses: u32,
    #[serde(default)]
    pub source_windows: Vec<GridWindow>,
    #[serde(default)]
    pub destination_windows: Vec<GridWindow>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Output {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default = "default_report_interval")]
    pub report_interval_steps: u64,
    /// Only report snapshots of vehicles loaded from route definitions.
    #[serde(default)]
    pub foreground_only: bool,
}

impl Default for Output {
    fn default() -> Self {
        Output {
            output_dir: default_output_dir(),
            logging: Logging::None,
            report_interval_steps: default_report_interval(),
            foreground_only: false,
        }
    }
}

/// Have this extra layer of log level enum, as tracing subscriber has no
/// off/none option by default. At least it can't be parsed
#[derive(PartialEq, Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub enum Logging {
    #[default]
    None,
    Info,
}

fn default_true() -> bool {
    true
}

fn default_to_1() -> u32 {
    1
}

fn default_to_3() -> u32 {
    3
}

fn default_cell_size() -> f64 {
    500.
}

fn default_steps_per_second() -> u32 {
    5
}

fn default_max_num_steps() -> u64 {
    3600
}

fn default_look_ahead() -> f64 {
    50.
}

fn default_seed() -> u64 {
    4711
}

fn default_min_safety_gap() -> f64 {
    1.
}

fn default_safe_crossing_time() -> f64 {
    3.
}

fn default_jam_speed() -> f64 {
    1.
}

fn default_priority_lane_distance() -> f64 {
    100.
}

fn default_detection_range() -> f64 {
    30.
}

fn default_turn_speed() -> f64 {
    7.
}

fn default_tram_stop_seconds() -> f64 {
    20.
}

fn default_bus_stop_seconds() -> f64 {
    10.
}

fn default_new_vehicles_per_step() -> u32 {
    5
}

fn default_green() -> f64 {
    20.
}

fn default_yellow() -> f64 {
    3.
}

fn default_red() -> f64 {
    2.
}

fn default_max_green() -> f64 {
    60.
}

fn default_group_radius() -> f64 {
    40.
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}

fn default_report_interval() -> u64 {
    10
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use crate::simulation::config::{Config, LightTiming, PartitionMethod, SyncMode};

    #[test]
    fn read_yaml_with_defaults() {
        let yaml = r#"
partitioning:
  num_workers: 4
  method: Metis
simulation:
  steps_per_second: 10
  sync: Psp
lights:
  timing: Dynamic
vehicles:
  num_private: 200
  source_windows:
    - min_row: 0
      min_col: 0
      max_row: 1
      max_col: 1
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(4, config.partitioning.num_workers);
        assert_eq!(PartitionMethod::Metis, config.partitioning.method);
        assert_eq!(SyncMode::Psp, config.simulation.sync);
        assert_eq!(10, config.simulation.steps_per_second);
        assert_eq!(LightTiming::Dynamic, config.lights.timing);
        assert_eq!(200, config.vehicles.num_private);
        assert!(config.vehicles.source_windows[0].contains(1, 0));
        assert!(!config.vehicles.source_windows[0].contains(2, 0));
        // untouched sections fall back to defaults
        assert_eq!(50., config.simulation.look_ahead_distance);
        assert_eq!(3, config.reroute.max_num_reroute);
        assert_eq!(Some(file.path().to_path_buf()), *config.context());
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = Config::from_file(std::path::Path::new("/does/not/exist.yml"));
        assert!(result.is_err());
    }

    #[test]
    fn overrides() {
        let mut config = Config::default();
        config.apply_overrides(&[
            ("partitioning.num_workers".to_string(), "3".to_string()),
            ("simulation.sync".to_string(), "psp".to_string()),
            ("unknown.key".to_string(), "1".to_string()),
        ]);
        assert_eq!(3, config.partitioning.num_workers);
        assert_eq!(SyncMode::Psp, config.simulation.sync);
    }

    #[test]
    fn step_conversions() {
        let config = Config::default();
        assert_eq!(0.2, config.step_size());
    }
}
