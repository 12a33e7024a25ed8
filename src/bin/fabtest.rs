//! Distributed fabric test harness.
//!
//! Without a server address the binary listens on the management port and
//! serves test cases. With one it loads a test series and drives the server
//! through it.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use fabtest::config::{TestOptions, DEFAULT_DATA_PORT, DEFAULT_MGMT_PORT};
use fabtest::control::{run_client, serve_session, ControlChannel, ControlListener, ResultTally};
use fabtest::pair::{fork_and_pair, wait_child, ForkRole};
use fabtest::provider::Registry;
use fabtest::runner::FabricTestRunner;
use fabtest::series::TestSeries;
use fabtest::{get_hostname, initialize_logger};

#[derive(Parser, Debug, Clone)]
#[command(name = "fabtest")]
#[command(about = "Run fabric tests between a client and a listening server")]
struct Args {
    /// Server address. Runs as client when given, as server otherwise
    server: Option<String>,

    /// Management channel port
    #[arg(short = 'q', long, default_value = DEFAULT_MGMT_PORT)]
    mgmt_port: String,

    /// Server exits after one client session
    #[arg(short = 'x', long)]
    non_persistent: bool,

    /// Test series file
    #[arg(short = 'u', long)]
    config: Option<PathBuf>,

    /// Provider name, selects test_configs/<provider>/<test>.json
    #[arg(short = 'p', long)]
    provider: Option<String>,

    /// Test name, selects test_configs/<provider>/<test>.json
    #[arg(short = 't', long)]
    test: Option<String>,

    /// First test index to run
    #[arg(short = 'y', long, default_value_t = 0)]
    start: u32,

    /// Last test index to run
    #[arg(short = 'z', long, default_value_t = 0)]
    end: u32,

    /// Local address for the client data endpoint
    #[arg(short = 's', long)]
    src_addr: Option<String>,

    /// Local port for the client data endpoint
    #[arg(short = 'B', long, default_value = "0")]
    src_port: String,

    /// Server data endpoint port
    #[arg(short = 'P', long, default_value = DEFAULT_DATA_PORT)]
    dst_port: String,

    /// Receive timeout in milliseconds for every case, -1 waits forever
    #[arg(long)]
    timeout: Option<i32>,

    /// Verify payload contents
    #[arg(short = 'v', long)]
    verify: bool,

    /// Page align message buffers
    #[arg(short = 'l', long)]
    align: bool,

    /// Fork a local server and run the client against it
    #[arg(long)]
    colocated: bool,
}

impl Args {
    fn base_options(&self) -> TestOptions {
        TestOptions::default().with_verify_data(self.verify).with_align(self.align)
    }

    fn series_path(&self) -> anyhow::Result<PathBuf> {
        match (&self.config, &self.provider, &self.test) {
            (Some(path), _, _) => Ok(path.clone()),
            (None, Some(provider), Some(test)) => Ok(TestSeries::named_path(provider, test)),
            _ => bail!("a client needs --config, or both --provider and --test"),
        }
    }
}

fn client(args: &Args, server: &str) -> anyhow::Result<ResultTally> {
    let path = args.series_path()?;
    let mut series = TestSeries::load(&path).with_context(|| format!("loading test series {}", path.display()))?;
    series.set_destination(server, &args.dst_port);
    let mut cases = series.range(args.start, args.end);
    if let Some(ms) = args.timeout {
        for case in &mut cases {
            case.timeout_ms = ms;
        }
    }
    log::info!("{} running {} of {} test cases against {}", get_hostname(), cases.len(), series.len(), server);

    let mut runner = FabricTestRunner::new(Registry::default(), args.base_options());
    if let Some(src) = &args.src_addr {
        runner = runner.with_source(src, &args.src_port);
    }
    let mut channel = ControlChannel::connect(server, &args.mgmt_port)?;
    let mut tally = ResultTally::default();
    let result = run_client(&mut channel, &mut runner, &cases, &mut tally);
    channel.shutdown();
    result.context("control channel failed")?;
    Ok(tally)
}

fn serve(args: &Args, listener: &ControlListener) -> anyhow::Result<ResultTally> {
    let mut tally = ResultTally::default();
    loop {
        let mut channel = listener.accept()?;
        let mut runner = FabricTestRunner::new(Registry::default(), args.base_options());
        let mut session = ResultTally::default();
        let result = serve_session(&mut channel, &mut runner, &mut session);
        channel.shutdown();
        tally.merge(&session);
        match result {
            Ok(()) => session.show(),
            Err(e) if args.non_persistent => return Err(e).context("serving client"),
            Err(e) => log::error!("{} client session ended: {}", get_hostname(), e),
        }
        if args.non_persistent {
            return Ok(tally);
        }
    }
}

fn colocated(args: &Args) -> anyhow::Result<ResultTally> {
    let (role, mut barrier) = fork_and_pair()?;
    match role {
        ForkRole::Child => {
            let server_args = Args { non_persistent: true, ..args.clone() };
            let code = match ControlListener::bind(Some("127.0.0.1"), &args.mgmt_port) {
                Ok(listener) => {
                    barrier.sync(0)?;
                    match serve(&server_args, &listener) {
                        Ok(tally) if tally.error == 0 => 0,
                        Ok(_) => 1,
                        Err(e) => {
                            log::error!("{}: {:#}", get_hostname(), e);
                            1
                        }
                    }
                }
                Err(e) => {
                    barrier.sync(e.code())?;
                    1
                }
            };
            std::process::exit(code);
        }
        ForkRole::Parent { child } => {
            let status = barrier.sync(0)?;
            if status != 0 {
                wait_child(child)?;
                bail!("local server failed to start with code {}", status);
            }
            let tally = client(args, args.server.as_deref().unwrap_or("127.0.0.1"));
            let child_status = wait_child(child)?;
            if child_status != 0 {
                log::warn!("local server exited with status {}", child_status);
            }
            tally
        }
    }
}

fn main() -> anyhow::Result<()> {
    initialize_logger();
    let args = Args::parse();

    let tally = if args.colocated {
        colocated(&args)?
    } else if let Some(server) = &args.server {
        client(&args, server)?
    } else {
        let listener = ControlListener::bind(None, &args.mgmt_port)?;
        serve(&args, &listener)?
    };

    println!("{}", tally);
    Ok(())
}
