//! `ilumi-mesh`: control and mesh mapping tool for Ilumi BLE bulbs.
//!
//! Every bulb command resolves its targets from the config store, then either
//! connects to each target in turn (bounded by `max_connections`) or, with
//! `--proxy-via`, connects once and forwards through the mesh.

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use mesh_session::{
    known_names, resolve_seeds, BleConnector, MeshCrawler, Session, SessionError,
    SessionManager, TargetOutcome,
};
use mesh_storage::{open_store, Registry, StorageMode, TargetSelector};
use mesh_topology::{compute_backbone, Layout, MeshSnapshot};
use mesh_wire::{ColorFrame, MacAddr, Scene};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::MeshConfig;
use logging::IlumiLogFormatter;

/// How long the name lookup scan before a crawl may take
const NAME_SCAN_TIMEOUT: Duration = Duration::from_secs(2);

/// Control and map Ilumi BLE bulbs
#[derive(Parser, Debug)]
#[command(name = "ilumi-mesh", version, about = "Control and map Ilumi BLE smart bulbs")]
struct Args {
    /// Tool configuration file
    #[arg(long, default_value = "ilumi.yaml")]
    config: PathBuf,

    /// Config store overriding the configuration file
    #[arg(long)]
    store: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print machine-readable results
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

/// Which bulbs a command acts on
#[derive(ClapArgs, Debug, Clone, Default)]
struct Targets {
    /// Bulb address
    #[arg(long)]
    mac: Option<MacAddr>,

    /// Enrolled bulb name
    #[arg(long)]
    name: Option<String>,

    /// Enrolled group
    #[arg(long)]
    group: Option<String>,

    /// Every enrolled bulb
    #[arg(long)]
    all: bool,

    /// Connect to this bulb and forward through the mesh
    #[arg(long)]
    proxy_via: Option<MacAddr>,
}

impl Targets {
    fn selector(&self) -> TargetSelector {
        TargetSelector {
            mac: self.mac,
            name: self.name.clone(),
            group: self.group.clone(),
            all: self.all,
        }
    }
}

#[derive(ClapArgs, Debug, Clone)]
struct ColorArgs {
    /// Red 0-255
    r: i32,
    /// Green 0-255
    g: i32,
    /// Blue 0-255
    b: i32,
    /// White 0-255
    #[arg(default_value_t = 0)]
    w: i32,
    /// Brightness 0-255
    #[arg(long, default_value_t = 255)]
    brightness: i32,
}

impl ColorArgs {
    fn frame(&self) -> ColorFrame {
        ColorFrame::new(self.r, self.g, self.b, self.w, self.brightness)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan for nearby bulbs
    Scan {
        #[arg(long, default_value = "5s")]
        timeout: humantime::Duration,
    },
    /// Turn bulbs on
    On {
        #[command(flatten)]
        targets: Targets,
        #[arg(long, default_value_t = 0)]
        delay: u16,
        #[arg(long, default_value_t = 0)]
        transit: u16,
    },
    /// Turn bulbs off
    Off {
        #[command(flatten)]
        targets: Targets,
        #[arg(long, default_value_t = 0)]
        delay: u16,
        #[arg(long, default_value_t = 0)]
        transit: u16,
    },
    /// Set a color
    Color {
        #[command(flatten)]
        targets: Targets,
        #[command(flatten)]
        color: ColorArgs,
        /// Do not wait for write acknowledgements
        #[arg(long)]
        fast: bool,
    },
    /// Fade to a color
    Smooth {
        #[command(flatten)]
        targets: Targets,
        #[command(flatten)]
        color: ColorArgs,
        #[arg(long, default_value = "1s")]
        duration: humantime::Duration,
        /// Seconds before the fade starts
        #[arg(long, default_value_t = 0)]
        delay_sec: u32,
    },
    /// Candle flicker around a color
    Candle {
        #[command(flatten)]
        targets: Targets,
        #[command(flatten)]
        color: ColorArgs,
    },
    /// Upload a scene from a JSON file
    Pattern {
        #[command(flatten)]
        targets: Targets,
        file: PathBuf,
    },
    /// Play a stored scene
    StartPattern {
        #[command(flatten)]
        targets: Targets,
        index: u8,
    },
    /// Read the current color
    GetColor {
        #[command(flatten)]
        targets: Targets,
    },
    /// Read firmware and hardware details
    Info {
        #[command(flatten)]
        targets: Targets,
    },
    /// Read routing tables
    MeshInfo {
        #[command(flatten)]
        targets: Targets,
    },
    /// Enroll a bulb and join it to the network
    Commission {
        #[arg(long)]
        mac: MacAddr,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "default")]
        group: String,
        /// Node id, next free one when unset
        #[arg(long)]
        node_id: Option<u16>,
        #[arg(long, default_value_t = 1)]
        group_id: u16,
        /// Network key, the stored or a new random one when unset
        #[arg(long)]
        network_key: Option<u32>,
    },
    /// Forget an enrolled bulb
    Remove {
        #[arg(long)]
        mac: MacAddr,
    },
    /// Reboot bulbs into the bootloader
    Dfu {
        #[command(flatten)]
        targets: Targets,
        /// Required, the bulb stops working until new firmware is flashed
        #[arg(long)]
        force: bool,
    },
    /// Crawl the mesh and lay out its topology
    Map {
        /// Crawl start points, enrolled bulbs or a scan when omitted
        #[arg(long = "seed")]
        seeds: Vec<MacAddr>,
        /// Use a saved snapshot instead of crawling
        #[arg(long)]
        load: Option<PathBuf>,
        /// Save the crawl as a snapshot
        #[arg(long)]
        save: Option<PathBuf>,
        /// Layout output file
        #[arg(long, default_value = "mesh_layout.json")]
        output: PathBuf,
        /// Add each node's two strongest links to the backbone
        #[arg(long)]
        redundancy: bool,
        /// Print the RSSI matrix
        #[arg(long)]
        matrix: bool,
    },
}

/// A bulb operation independent of how the bulb is reached
#[derive(Debug, Clone)]
enum Action {
    On { delay: u16, transit: u16 },
    Off { delay: u16, transit: u16 },
    Color { color: ColorFrame, fast: bool },
    Smooth { color: ColorFrame, duration_ms: u32, delay_sec: u32 },
    Candle(ColorFrame),
    Pattern(Scene),
    StartPattern(u8),
    GetColor,
    Info,
    MeshInfo,
    Dfu,
}

impl Action {
    fn is_query(&self) -> bool {
        matches!(self, Action::GetColor | Action::Info | Action::MeshInfo)
    }

    fn direct_only(&self) -> bool {
        matches!(self, Action::Info | Action::MeshInfo)
    }
}

async fn run_action(
    session: &Session,
    action: &Action,
    targets: Option<&[MacAddr]>,
) -> Result<Option<Value>, SessionError> {
    match action {
        Action::On { delay, transit } => session.turn_on(*delay, *transit, targets).await?,
        Action::Off { delay, transit } => session.turn_off(*delay, *transit, targets).await?,
        Action::Color { color, fast: true } => session.set_color_fast(*color, targets).await?,
        Action::Color { color, fast: false } => session.set_color(*color, targets).await?,
        Action::Smooth {
            color,
            duration_ms,
            delay_sec,
        } => {
            session
                .set_color_smooth(*color, *duration_ms, *delay_sec, targets)
                .await?
        }
        Action::Candle(color) => session.set_candle_mode(*color, targets).await?,
        Action::Pattern(scene) => session.set_color_pattern(scene.clone(), targets).await?,
        Action::StartPattern(index) => session.start_color_pattern(*index, targets).await?,
        Action::Dfu => session.enter_dfu_mode(targets).await?,
        Action::GetColor => {
            return Ok(Some(json!(session.get_bulb_color(targets).await?)));
        }
        Action::Info => return Ok(Some(json!(session.get_device_info().await?))),
        Action::MeshInfo => return Ok(Some(json!(session.get_mesh_info().await?))),
    }
    Ok(None)
}

/// Per-target result line for output
#[derive(Debug, Serialize)]
struct TargetReport {
    name: String,
    #[serde(flatten)]
    outcome: TargetOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

fn outcome_of<T>(result: &Result<T, SessionError>) -> TargetOutcome {
    match result {
        Ok(_) => TargetOutcome {
            success: true,
            error: None,
        },
        Err(e) => TargetOutcome {
            success: false,
            error: Some(e.to_string()),
        },
    }
}

struct App {
    config: MeshConfig,
    registry: Registry,
    json: bool,
}

impl App {
    fn manager(&self, connector: Arc<dyn BleConnector>) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            connector,
            self.registry.clone(),
            self.config.session.to_session_config(),
            self.config.max_connections,
        ))
    }

    async fn connect(&self) -> Result<Arc<SessionManager>> {
        let connector = native_connector(&self.config).await?;
        Ok(self.manager(connector))
    }

    async fn execute(&self, targets: &Targets, action: Action) -> Result<()> {
        let addresses = self.registry.resolve_targets(&targets.selector()).await?;
        if addresses.is_empty() {
            bail!("No target bulbs. Use --mac, --name, --group or --all, or enroll bulbs first");
        }
        if targets.proxy_via.is_some() && action.direct_only() {
            bail!("This query cannot be proxied; connect to the bulb directly");
        }

        let manager = self.connect().await?;
        let data: Mutex<BTreeMap<MacAddr, Value>> = Mutex::new(BTreeMap::new());

        let outcomes = match targets.proxy_via {
            Some(via) => {
                let session = manager.open(via).await?;
                info!("Proxying through {}", via);
                let mut outcomes = BTreeMap::new();
                if action.is_query() {
                    for target in &addresses {
                        let result = run_action(&session, &action, Some(std::slice::from_ref(target))).await;
                        if let Ok(Some(value)) = &result {
                            if let Ok(mut data) = data.lock() {
                                data.insert(*target, value.clone());
                            }
                        }
                        outcomes.insert(*target, outcome_of(&result));
                    }
                } else {
                    let result = run_action(&session, &action, Some(addresses.as_slice())).await;
                    let outcome = outcome_of(&result);
                    for target in &addresses {
                        outcomes.insert(*target, outcome.clone());
                    }
                }
                session.close().await;
                outcomes
            }
            None => {
                let action = &action;
                let data = &data;
                manager
                    .execute_on_targets(&addresses, |session| async move {
                        if let Some(value) = run_action(&session, action, None).await? {
                            if let Ok(mut data) = data.lock() {
                                data.insert(session.address(), value);
                            }
                        }
                        Ok(())
                    })
                    .await
            }
        };

        let mut data = data.into_inner().unwrap_or_default();
        let mut report = BTreeMap::new();
        for (mac, outcome) in outcomes {
            let name = self.registry.display_name(&mac).await?;
            report.insert(
                mac,
                TargetReport {
                    name,
                    outcome,
                    data: data.remove(&mac),
                },
            );
        }
        self.print_report(&report)?;

        if report.values().any(|r| !r.outcome.success) {
            let failed = report.values().filter(|r| !r.outcome.success).count();
            bail!("{} of {} targets failed", failed, report.len());
        }
        Ok(())
    }

    fn print_report(&self, report: &BTreeMap<MacAddr, TargetReport>) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(report)?);
            return Ok(());
        }
        for (mac, entry) in report {
            match &entry.outcome.error {
                None => println!("✓ {} ({})", entry.name, mac),
                Some(e) => println!("✗ {} ({}): {}", entry.name, mac, e),
            }
            if let Some(data) = &entry.data {
                match data {
                    Value::Null => println!("    no reply"),
                    other => println!("    {}", serde_json::to_string_pretty(other)?.replace('\n', "\n    ")),
                }
            }
        }
        Ok(())
    }

    async fn scan(&self, timeout: Duration) -> Result<()> {
        let manager = self.connect().await?;
        let found = manager.discover(timeout).await?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&found)?);
            return Ok(());
        }
        if found.is_empty() {
            println!("No Ilumi bulbs found.");
        }
        for bulb in found {
            let rssi = bulb.rssi.map(|r| format!("{} dBm", r)).unwrap_or_else(|| "?".to_string());
            println!(
                "{}  {:<20} {}",
                bulb.address,
                bulb.name.as_deref().unwrap_or("Unknown"),
                rssi
            );
        }
        Ok(())
    }

    async fn network_key(&self, requested: Option<u32>) -> Result<u32> {
        if let Some(key) = requested {
            return Ok(key);
        }
        let stored = self.registry.network_key().await?;
        if stored != 0 {
            info!("Using existing network key {}", stored);
            return Ok(stored);
        }
        // stored by the commission once it succeeds
        let key = rand::thread_rng().gen_range(1000..=999_999);
        info!("Generated new network key {}", key);
        Ok(key)
    }

    async fn commission(
        &self,
        mac: MacAddr,
        name: &str,
        group: &str,
        node_id: Option<u16>,
        group_id: u16,
        network_key: Option<u32>,
    ) -> Result<()> {
        let key = self.network_key(network_key).await?;
        let manager = self.connect().await?;
        let node_id = manager
            .enroll(mac, name, group, node_id, group_id, key)
            .await
            .with_context(|| format!("commissioning {}", mac))?;

        crate::component_info!("enroll", "Commissioned '{}' ({}) as node {}", name, mac, node_id);
        if self.json {
            println!("{}", json!({ "mac": mac, "name": name, "group": group, "node_id": node_id }));
        } else {
            println!("✓ {} ({}) enrolled as node {}", name, mac, node_id);
        }
        Ok(())
    }

    async fn remove(&self, mac: MacAddr) -> Result<()> {
        if self.registry.remove_bulb(&mac).await? {
            println!("Removed {}", mac);
            Ok(())
        } else {
            bail!("{} is not enrolled", mac)
        }
    }

    async fn map(
        &self,
        seeds: &[MacAddr],
        load: Option<PathBuf>,
        save: Option<PathBuf>,
        output: PathBuf,
        redundancy: bool,
        matrix: bool,
    ) -> Result<()> {
        let snapshot = match load {
            Some(path) => MeshSnapshot::load(&path)?,
            None => {
                let manager = self.connect().await?;
                let names = known_names(&self.registry, &manager, NAME_SCAN_TIMEOUT).await?;
                let seeds = resolve_seeds(&manager, seeds, self.config.scan_timeout()).await?;
                if seeds.is_empty() {
                    bail!("No bulbs to start the crawl from");
                }
                let report = MeshCrawler::new(manager).crawl(seeds).await;
                for (mac, reason) in &report.skipped {
                    crate::component_warn!("map", "Skipped {}: {}", mac, reason);
                }
                report.snapshot(names)
            }
        };

        if let Some(path) = save {
            snapshot.save(&path)?;
        }

        let graph = snapshot.graph()?;
        let backbone = compute_backbone(&graph, redundancy);
        let layout = Layout::compute(&graph, &backbone, &self.config.layout);
        crate::component_debug!("map", "Layout computed for {} nodes", layout.positions.len());

        let document = json!({
            "positions": layout.positions,
            "edges": layout.edges,
            "names": snapshot.name_map,
        });
        std::fs::write(&output, serde_json::to_string_pretty(&document)?)
            .with_context(|| format!("writing {}", output.display()))?;

        if matrix {
            print!("{}", graph.rssi_matrix(&snapshot.name_map));
        }
        if self.json {
            println!("{}", serde_json::to_string_pretty(&document)?);
        } else {
            println!(
                "Mapped {} bulbs, {} links ({} backbone) -> {}",
                graph.node_count(),
                graph.links().len(),
                backbone.len(),
                output.display()
            );
        }
        Ok(())
    }
}

#[cfg(feature = "native-ble")]
async fn native_connector(config: &MeshConfig) -> Result<Arc<dyn BleConnector>> {
    let adapter =
        mesh_session::NativeAdapter::new(config.adapter.as_deref(), config.scan_timeout()).await?;
    Ok(Arc::new(adapter))
}

#[cfg(not(feature = "native-ble"))]
async fn native_connector(_config: &MeshConfig) -> Result<Arc<dyn BleConnector>> {
    bail!("built without BLE support; rebuild with --features native-ble")
}

fn read_scene(path: &PathBuf) -> Result<Scene> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("parsing scene {}", path.display()))
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("ilumi_mesh={}", args.log_level).parse()?)
        .add_directive(format!("mesh_session={}", args.log_level).parse()?)
        .add_directive(format!("mesh_storage={}", args.log_level).parse()?)
        .add_directive(format!("mesh_topology={}", args.log_level).parse()?)
        .add_directive(format!("mesh_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .event_format(IlumiLogFormatter::new("ilumi-mesh"))
        .init();

    let mut config = MeshConfig::load_from_file(&args.config)?;
    if let Some(store) = args.store {
        config.config_store = store;
    }
    debug!("Using config store {:?}", config.config_store);

    let store = open_store(StorageMode::File {
        path: config.config_store.clone(),
    })
    .await
    .with_context(|| format!("opening config store {}", config.config_store.display()))?;

    let app = App {
        registry: Registry::new(store),
        config,
        json: args.json,
    };

    match args.command {
        Command::Scan { timeout } => app.scan(timeout.into()).await,
        Command::On {
            targets,
            delay,
            transit,
        } => app.execute(&targets, Action::On { delay, transit }).await,
        Command::Off {
            targets,
            delay,
            transit,
        } => app.execute(&targets, Action::Off { delay, transit }).await,
        Command::Color {
            targets,
            color,
            fast,
        } => {
            let action = Action::Color {
                color: color.frame(),
                fast,
            };
            app.execute(&targets, action).await
        }
        Command::Smooth {
            targets,
            color,
            duration,
            delay_sec,
        } => {
            let duration: Duration = duration.into();
            let action = Action::Smooth {
                color: color.frame(),
                duration_ms: duration.as_millis().min(u32::MAX as u128) as u32,
                delay_sec,
            };
            app.execute(&targets, action).await
        }
        Command::Candle { targets, color } => {
            app.execute(&targets, Action::Candle(color.frame())).await
        }
        Command::Pattern { targets, file } => {
            let scene = read_scene(&file)?;
            app.execute(&targets, Action::Pattern(scene)).await
        }
        Command::StartPattern { targets, index } => {
            app.execute(&targets, Action::StartPattern(index)).await
        }
        Command::GetColor { targets } => app.execute(&targets, Action::GetColor).await,
        Command::Info { targets } => app.execute(&targets, Action::Info).await,
        Command::MeshInfo { targets } => app.execute(&targets, Action::MeshInfo).await,
        Command::Commission {
            mac,
            name,
            group,
            node_id,
            group_id,
            network_key,
        } => {
            app.commission(mac, &name, &group, node_id, group_id, network_key)
                .await
        }
        Command::Remove { mac } => app.remove(mac).await,
        Command::Dfu { targets, force } => {
            if !force {
                bail!("Entering the bootloader leaves the bulb unusable until it is reflashed; pass --force");
            }
            crate::component_warn!("dfu", "Sending bootloader entry");
            app.execute(&targets, Action::Dfu).await
        }
        Command::Map {
            seeds,
            load,
            save,
            output,
            redundancy,
            matrix,
        } => app.map(&seeds, load, save, output, redundancy, matrix).await,
    }
}
