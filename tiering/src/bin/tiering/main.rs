// vim: tw=80
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    process::exit,
    sync::Arc,
    time::Duration,
};

use clap::{crate_version, Parser};
use itertools::Itertools;
use serde_derive::Deserialize;
use tiering_core::{
    engine::{Engine, PoolEvent, Status},
    property::{Property, PropertyName, TieringConfig},
    sim::{SimLayout, SimPool},
    window::WindowState,
    ClassT,
    Error,
    Result,
    TxgT,
};
use tokio::time::{self, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const POOLNAME: &str = "simpool";

/// Contents of a simulation configuration file
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SimConfig {
    layout:  SimLayout,
    tiering: TieringConfig,
}

impl SimConfig {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(SimConfig::default());
        };
        let s = fs::read_to_string(path)?;
        let config: SimConfig = serde_yaml_ng::from_str(&s)
            .map_err(|e| {
                eprintln!("Invalid configuration {}: {e}", path.display());
                Error::EINVAL
            })?;
        config.tiering.validate()?;
        Ok(config)
    }

    /// Apply `name=value` overrides from the command line.
    fn apply(&mut self, props: &[String]) {
        for ps in props {
            let r = Property::try_from(ps.as_str())
                .and_then(|prop| self.tiering.set(prop));
            if r.is_err() {
                eprintln!("Invalid property specification {ps}");
                exit(2);
            }
        }
    }
}

fn parse_propname(s: &str) -> std::result::Result<PropertyName, String> {
    PropertyName::try_from(s).map_err(|_| format!("unknown property {s}"))
}

#[derive(Parser, Clone, Debug)]
/// Display tiering properties
struct Props {
    /// Configuration file, with `layout` and `tiering` sections
    #[clap(short = 'c', long)]
    config:     Option<PathBuf>,
    #[clap(short = 'p', long, help = "Scriptable output")]
    parseable:  bool,
    /// Properties to display, comma delimited.  All if omitted.
    #[clap(value_delimiter(','), value_parser = parse_propname)]
    properties: Vec<PropertyName>,
}

impl Props {
    fn main(self) -> Result<()> {
        let config = SimConfig::load(self.config.as_deref())?;
        let names = if self.properties.is_empty() {
            PropertyName::all()
        } else {
            self.properties
        };
        let rows = names.into_iter()
            .unique()
            .map(|name| {
                let prop = config.tiering.get(name).to_string();
                // Property's Display form is name=value
                let value = prop.split_once('=')
                    .map(|(_, v)| v.to_owned())
                    .unwrap_or_default();
                (name.to_string(), value)
            }).collect::<Vec<_>>();
        if self.parseable {
            let stdout = io::stdout();
            let mut buf = io::BufWriter::new(stdout.lock());
            for (name, value) in rows {
                writeln!(buf, "{name}\t{value}")?;
            }
            buf.flush()?;
        } else {
            let mut table = tabular::Table::new("{:<}  {:<}");
            table.add_row(tabular::Row::new()
                          .with_cell("PROPERTY")
                          .with_cell("VALUE"));
            for (name, value) in rows {
                table.add_row(tabular::Row::new()
                              .with_cell(name)
                              .with_cell(value));
            }
            print!("{table}");
        }
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
/// Run a synthetic workload through the tiering engine on an in-memory pool
struct Simulate {
    /// Configuration file, with `layout` and `tiering` sections
    #[clap(short = 'c', long)]
    config:     Option<PathBuf>,
    /// Tiering properties to override, comma delimited
    #[clap(short = 'o', long, value_delimiter(','))]
    properties: Vec<String>,
    /// Number of migration windows to run
    #[clap(short = 'w', long, default_value_t = 4)]
    windows:    u32,
    /// Objects written before each window.  Half of them overwrite objects
    /// from the previous window.
    #[clap(long, default_value_t = 16)]
    objects:    u64,
    /// Blocks in each object
    #[clap(long, default_value_t = 4)]
    blocks:     usize,
    /// Size of each block, in bytes
    #[clap(long, default_value_t = 4096)]
    bsize:      usize,
    /// Crash the pool and reattach the engine while each window is open
    #[clap(long)]
    crash:      bool,
    /// Give up on a window after this many seconds
    #[clap(long, default_value_t = 60)]
    timeout:    u64,
    #[clap(short = 'p', long, help = "Scriptable output")]
    parseable:  bool,
}

/// One closed window, for the report
struct WindowReport {
    start_txg:  TxgT,
    finish_txg: TxgT,
    blocks:     u64,
}

impl Simulate {
    /// Deterministic contents for one object
    fn contents(&self, object: u64) -> Vec<Vec<u8>> {
        (0..self.blocks).map(|i| {
            let fill = (object as u8).wrapping_mul(31).wrapping_add(i as u8);
            vec![fill; self.bsize]
        }).collect()
    }

    async fn attach(pool: &Arc<SimPool>, config: &TieringConfig)
        -> Result<Engine>
    {
        Engine::attach(POOLNAME, config.clone(), pool.collaborators()).await
    }

    /// Wait for the window ending at `finish` to close.
    async fn wait_closed(&self, engine: &Engine, finish: TxgT) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(self.timeout);
        loop {
            let status = engine.status();
            if let Some(fault) = status.fault {
                eprintln!("Tiering faulted: {:?} {}", fault.source,
                          fault.error);
                return Err(Error::ENOTRECOVERABLE);
            }
            if status.window_state == WindowState::Closed &&
                status.start_txg == finish + 1
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                eprintln!("Timed out waiting for window ending at {finish}");
                return Err(Error::ETIMEDOUT);
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn main(self) -> Result<()> {
        let mut config = SimConfig::load(self.config.as_deref())?;
        config.apply(&self.properties);
        let pool = Arc::new(SimPool::new(POOLNAME, &config.layout));
        let mut engine = Self::attach(&pool, &config.tiering).await?;
        let mut events = engine.subscribe();
        let mut listener = engine.snapshot_listener();
        let stride = (self.objects / 2).max(1);
        let mut reports = Vec::new();
        let mut last_object = 0;

        for w in 0..u64::from(self.windows) {
            let first = w * stride;
            last_object = first + self.objects;
            for object in first..last_object {
                pool.write_object(&engine, object, &self.contents(object),
                                  false)?;
            }
            let Some(finish) = pool.take_snapshot(&listener).await else {
                warn!(window = w, "bounding snapshot refused");
                pool.commit();
                continue;
            };
            // Make the open window durable
            pool.commit();
            if self.crash {
                engine.shutdown().await;
                pool.crash();
                info!(window = w, "pool crashed");
                engine = Self::attach(&pool, &config.tiering).await?;
                events = engine.subscribe();
                listener = engine.snapshot_listener();
            }
            self.wait_closed(&engine, finish).await?;
            // Commit the frees
            pool.commit();
            while let Ok(event) = events.try_recv() {
                if let PoolEvent::WindowClosed { start_txg, finish_txg, blocks }
                    = event
                {
                    reports.push(WindowReport {start_txg, finish_txg, blocks});
                }
            }
        }

        let mut bad = 0;
        for object in 0..last_object {
            match pool.read_object(&engine, object).await {
                Ok(data) if data == self.contents(object) => (),
                Ok(_) => {
                    eprintln!("object {object}: contents mismatch");
                    bad += 1;
                }
                Err(e) => {
                    eprintln!("object {object}: {e}");
                    bad += 1;
                }
            }
        }
        let status = engine.status();
        engine.shutdown().await;
        self.report(&pool, &status, &reports, last_object - bad)?;
        if bad > 0 || pool.bad_frees() > 0 {
            return Err(Error::EIO);
        }
        Ok(())
    }

    fn report(&self,
              pool: &SimPool,
              status: &Status,
              reports: &[WindowReport],
              verified: u64) -> Result<()>
    {
        let summary = [
            ("state", status.window_state.to_string()),
            ("start_txg", status.start_txg.to_string()),
            ("watermark", status.watermark.to_string()),
            ("special_alloc", status.special_alloc.to_string()),
            ("special_blocks", pool.blocks_on(ClassT::Special).to_string()),
            ("special_bytes", pool.allocated(ClassT::Special).to_string()),
            ("normal_bytes", pool.allocated(ClassT::Normal).to_string()),
            ("bad_frees", pool.bad_frees().to_string()),
            ("syncs", pool.syncs().to_string()),
            ("objects_verified", verified.to_string()),
        ];
        if self.parseable {
            let stdout = io::stdout();
            let mut buf = io::BufWriter::new(stdout.lock());
            for r in reports {
                writeln!(buf, "window\t{}\t{}\t{}", r.start_txg, r.finish_txg,
                         r.blocks)?;
            }
            for (k, v) in summary {
                writeln!(buf, "{k}\t{v}")?;
            }
            buf.flush()?;
        } else {
            let mut table = tabular::Table::new("{:>}  {:>}  {:>}");
            table.add_row(tabular::Row::new()
                          .with_cell("START")
                          .with_cell("FINISH")
                          .with_cell("BLOCKS"));
            for r in reports {
                table.add_row(tabular::Row::new()
                              .with_cell(r.start_txg)
                              .with_cell(r.finish_txg)
                              .with_cell(r.blocks));
            }
            println!("{table}");
            let mut table = tabular::Table::new("{:<}  {:>}");
            for (k, v) in summary {
                table.add_row(tabular::Row::new().with_cell(k).with_cell(v));
            }
            print!("{table}");
        }
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
enum SubCommand {
    Props(Props),
    Simulate(Simulate),
}

#[derive(Parser, Clone, Debug)]
#[clap(version = crate_version!())]
/// Write-cache tiering tools
struct Cli {
    #[clap(subcommand)]
    cmd: SubCommand,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .pretty()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli: Cli = Cli::parse();
    match cli.cmd {
        SubCommand::Props(props) => props.main(),
        SubCommand::Simulate(simulate) => simulate.main().await,
    }
}

// LCOV_EXCL_STOP
