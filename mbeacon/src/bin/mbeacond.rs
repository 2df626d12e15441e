//! The beacon daemon: command line parsing, socket setup, signal handling,
//! and the single-threaded event loop.

#[cfg(unix)]
fn main() {
    if let Err(e) = daemon::run() {
        eprintln!("mbeacond: {}", e);
        std::process::exit(1);
    }
}

#[cfg(not(unix))]
fn main() {
    eprintln!("mbeacond requires a POSIX platform");
    std::process::exit(1);
}

#[cfg(unix)]
mod daemon {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};

    use clap::Parser;

    use mbeacon::config::{DEFAULT_DUMP_FILE, DEFAULT_IPV4_SSM_CHANNEL, DEFAULT_IPV6_SSM_CHANNEL};
    use mbeacon::protocol::tag;
    use mbeacon::socket::{hostname, interface_index, UdpTransport};
    use mbeacon::util::now_millis;
    use mbeacon::{Address, BeaconConfig, BeaconEngine, BeaconError};

    /// Multicast beacon daemon measuring group reachability and quality.
    #[derive(Debug, Parser)]
    #[command(name = "mbeacond", version, about)]
    struct Args {
        /// Beacon name (defaults to the hostname)
        #[arg(short = 'n', long)]
        name: Option<String>,

        /// Administration contact mail address
        #[arg(short = 'a', long = "contact")]
        contact: Option<String>,

        /// Multicast group address to send probes to (ADDR[/PORT])
        #[arg(short = 'b', long = "beacon-addr")]
        beacon_addr: Option<Address>,

        /// Redistribute reports to this host/port; may be repeated
        #[arg(short = 'r', long = "redistribute")]
        redistribute: Vec<Address>,

        /// Enable SSM reception/sending, optionally on ADDR[/PORT]
        #[arg(short = 'S', long = "ssm", num_args = 0..=1, default_missing_value = "")]
        ssm: Option<String>,

        /// Bind to this local address
        #[arg(short = 's', long = "bind")]
        bind: Option<Address>,

        /// Listen for reports from other beacons on this address; may be repeated
        #[arg(short = 'l', long = "listen")]
        listen: Vec<Address>,

        /// Dump periodic reports to this file
        #[arg(short = 'd', long = "dump", num_args = 0..=1, default_missing_value = DEFAULT_DUMP_FILE)]
        dump: Option<PathBuf>,

        /// Interval between dumps in seconds
        #[arg(short = 'I', long = "dump-interval", default_value_t = 5)]
        dump_interval: u64,

        /// Announce a website: TYPE$URL where TYPE is lg, matrix or generic
        #[arg(short = 'W', long = "website")]
        websites: Vec<String>,

        /// Two letter country code to announce
        #[arg(short = 'C', long = "country")]
        country: Option<String>,

        /// Launch this program after each dump, with the dump path as argument
        #[arg(short = 'L', long = "launch")]
        launch: Option<String>,

        /// Use this interface for multicast instead of the default
        #[arg(short = 'i', long = "interface")]
        interface: Option<String>,

        /// Print periodic bandwidth usage reports
        #[arg(short = 'U', long = "bw-report")]
        bandwidth_report: bool,

        /// Increase verbosity (repeat for more)
        #[arg(short = 'v', action = clap::ArgAction::Count)]
        verbose: u8,
    }

    static TERMINATE: AtomicBool = AtomicBool::new(false);
    static DUMP_BW: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_terminate(_sig: libc::c_int) {
        TERMINATE.store(true, Ordering::Relaxed);
    }

    extern "C" fn on_usr1(_sig: libc::c_int) {
        DUMP_BW.store(true, Ordering::Relaxed);
    }

    /// Handlers only set flags; the event loop does the actual work.
    fn install_signal_handlers() {
        fn install(sig: libc::c_int, handler: extern "C" fn(libc::c_int)) {
            unsafe {
                libc::signal(sig, handler as usize);
            }
        }
        install(libc::SIGINT, on_terminate);
        install(libc::SIGTERM, on_terminate);
        install(libc::SIGUSR1, on_usr1);
    }

    fn init_logging(verbose: u8) {
        let level = match verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        };
        env_logger::Builder::from_default_env()
            .filter_level(level)
            .init();
    }

    fn build_config(args: &Args) -> Result<BeaconConfig, BeaconError> {
        let mut cfg = BeaconConfig {
            name: match &args.name {
                Some(name) => name.clone(),
                None => hostname().unwrap_or_default(),
            },
            admin_contact: args.contact.clone().unwrap_or_default(),
            country: args.country.clone().unwrap_or_default(),
            probe_group: args.beacon_addr,
            redistribute: args.redistribute.clone(),
            listen: args.listen.clone(),
            unicast: args.bind.unwrap_or_else(Address::unspecified),
            dump_file: args.dump.clone(),
            dump_interval_secs: args.dump_interval,
            launch_after_dump: args.launch.clone(),
            bandwidth_report: args.bandwidth_report,
            ..BeaconConfig::default()
        };

        if let Some(ssm) = &args.ssm {
            let literal = if ssm.is_empty() {
                // Family follows the probe group.
                if cfg.probe_group.map(|g| g.is_ipv6()).unwrap_or(true) {
                    DEFAULT_IPV6_SSM_CHANNEL
                } else {
                    DEFAULT_IPV4_SSM_CHANNEL
                }
            } else {
                ssm.as_str()
            };
            cfg.ssm_group = Some(literal.parse()?);
        }

        for site in &args.websites {
            let (t, url) = match site.split_once('$') {
                Some(("lg", url)) => (tag::WEBSITE_LG, url),
                Some(("matrix", url)) => (tag::WEBSITE_MATRIX, url),
                Some((_, url)) => (tag::WEBSITE_GENERIC, url),
                None => (tag::WEBSITE_GENERIC, site.as_str()),
            };
            cfg.websites.insert(t, url.to_string());
        }

        if let Some(name) = &args.interface {
            cfg.mcast_interface = interface_index(name)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn run() -> Result<(), BeaconError> {
        let args = Args::parse();
        init_logging(args.verbose);

        let mut cfg = build_config(&args)?;
        let (transport, unicast) = UdpTransport::new(&cfg)?;
        cfg.unicast = unicast;

        log::info!(
            "beacon '{}' starting [group: {}, local: {}]",
            cfg.name,
            cfg.probe_group
                .map(|g| g.to_string())
                .unwrap_or_else(|| "-".into()),
            unicast
        );

        install_signal_handlers();

        let mut engine = BeaconEngine::new(cfg, transport, now_millis());

        loop {
            if TERMINATE.load(Ordering::Relaxed) {
                log::info!("terminating, sending leave report");
                engine.send_leave_report(now_millis());
                return Ok(());
            }
            if DUMP_BW.swap(false, Ordering::Relaxed) {
                engine.bandwidth_summary(now_millis(), false);
            }

            let timeout = engine.next_timeout_ms(now_millis());
            let ready = engine.transport_mut().poll(timeout)?;
            for idx in ready {
                let kind = engine.transport_mut().kind(idx);
                loop {
                    match engine.transport_mut().recv(idx) {
                        Ok(Some(dgram)) => engine.on_datagram(kind, &dgram),
                        Ok(None) => break,
                        Err(e) => {
                            log::warn!("receive failed: {}", e);
                            break;
                        }
                    }
                }
            }
            engine.run_due(now_millis());
        }
    }
}
