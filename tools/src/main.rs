//! sockctl: exercise lwsock over the in-process loopback engine.

use std::error::Error;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use embedded_io::{Read, ReadExactError, Write};
use log::{debug, info};

use lwsock::addr::parse_numeric;
use lwsock::klog::{self, KLOG};
use lwsock::{
    AddrInfoHints, AddressFamily, AiFlags, Errno, LoopbackConfig, LoopbackEngine, MsgFlags,
    SockType, SocketApi, Stack, StackConfig,
};

#[derive(Parser)]
#[command(name = "sockctl", version, about = "Blocking sockets over a loopback TCP/IP engine")]
struct Args {
    /// Most verbose log level kept
    #[arg(short, long, value_enum, default_value_t = Level::Info)]
    log_level: Level,

    /// Echo log records to stderr as they are written
    #[arg(short, long)]
    verbose: bool,

    /// Print this many buffered log records on exit
    #[arg(long, default_value_t = 0)]
    dump_log: usize,

    /// Host table entry for the resolver, as NAME=ADDR
    #[arg(long = "host", value_parser = parse_host)]
    hosts: Vec<(String, String)>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream bytes through a TCP echo server
    Echo {
        #[arg(short, long, default_value_t = 7000)]
        port: u16,
        /// Total bytes to send
        #[arg(short, long, default_value_t = 65536)]
        bytes: usize,
        /// Bytes per write
        #[arg(short, long, default_value_t = 1460)]
        chunk: usize,
    },
    /// Send datagrams between two UDP sockets
    Dgram {
        #[arg(short, long, default_value_t = 7001)]
        port: u16,
        #[arg(short, long, default_value_t = 16)]
        count: usize,
    },
    /// Resolve a host name
    Lookup {
        name: String,
        /// Service (numeric port)
        #[arg(short, long)]
        service: Option<String>,
        #[arg(short, long, value_enum, default_value_t = Family::Any)]
        family: Family,
    },
    /// Run a short echo exchange and print the buffered log records
    Log {
        /// Records to print
        #[arg(short, long, default_value_t = 50)]
        count: usize,
        #[arg(short, long, default_value_t = 7002)]
        port: u16,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Level {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<Level> for log::LevelFilter {
    fn from(level: Level) -> Self {
        match level {
            Level::Off => log::LevelFilter::Off,
            Level::Error => log::LevelFilter::Error,
            Level::Warn => log::LevelFilter::Warn,
            Level::Info => log::LevelFilter::Info,
            Level::Debug => log::LevelFilter::Debug,
            Level::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Family {
    Any,
    #[value(name = "4")]
    V4,
    #[value(name = "6")]
    V6,
}

impl From<Family> for AddressFamily {
    fn from(family: Family) -> Self {
        match family {
            Family::Any => AddressFamily::Unspec,
            Family::V4 => AddressFamily::Inet,
            Family::V6 => AddressFamily::Inet6,
        }
    }
}

fn parse_host(entry: &str) -> Result<(String, String), String> {
    match entry.split_once('=') {
        Some((name, addr)) if !name.is_empty() && parse_numeric(addr).is_some() => {
            Ok((name.to_string(), addr.to_string()))
        }
        _ => Err(format!("expected NAME=ADDR, got {:?}", entry)),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    klog::init(args.log_level.into());
    klog::set_console_output(args.verbose);

    let result = run(&args);

    if args.dump_log > 0 {
        for entry in KLOG.recent(args.dump_log) {
            eprintln!("{}", entry.format());
        }
    }
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("sockctl: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), Box<dyn Error>> {
    let mut config = LoopbackConfig::default();
    let hosts = args
        .hosts
        .iter()
        .filter_map(|(name, addr)| parse_numeric(addr).map(|ip| (name.clone(), ip)))
        .collect();
    config.hosts = Some(hosts);

    let stack = Stack::start(Box::new(LoopbackEngine::new(config)), StackConfig::default())?;
    let api = Arc::new(SocketApi::new(stack.clone()));
    let outcome = match &args.command {
        Command::Echo { port, bytes, chunk } => echo(&api, *port, *bytes, *chunk),
        Command::Dgram { port, count } => dgram(&api, *port, *count),
        Command::Lookup { name, service, family } => lookup(&api, name, service.as_deref(), *family),
        Command::Log { count, port } => echo(&api, *port, 4096, 512).map(|()| {
            for entry in KLOG.recent(*count) {
                println!("{}", entry.format_colored());
            }
        }),
    };
    drop(api);
    stack.shutdown();
    outcome
}

fn local(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn echo(api: &Arc<SocketApi>, port: u16, bytes: usize, chunk: usize) -> Result<(), Box<dyn Error>> {
    let chunk = chunk.max(1);
    let listener = api.socket(AddressFamily::Inet, SockType::Stream, 0)?;
    api.bind(listener, local(port))?;
    api.listen(listener, 1)?;

    let server = {
        let api = api.clone();
        thread::spawn(move || -> Result<usize, Errno> {
            let (fd, peer) = api.accept(listener)?;
            debug!("echo: accepted {} as fd {}", peer, fd);
            let mut sock = api.get(fd)?;
            let mut buf = [0u8; 2048];
            let mut echoed = 0;
            loop {
                let n = sock.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                sock.write_all(&buf[..n])?;
                echoed += n;
            }
            api.close(fd)?;
            Ok(echoed)
        })
    };

    let started = Instant::now();
    let fd = api.socket(AddressFamily::Inet, SockType::Stream, 0)?;
    api.connect(fd, local(port))?;
    let mut sock = api.get(fd)?;
    let payload: Vec<u8> = (0..bytes).map(|i| (i % 251) as u8).collect();

    let reader = {
        let mut sock = sock.clone();
        thread::spawn(move || -> Result<Vec<u8>, Errno> {
            let mut back = vec![0u8; bytes];
            sock.read_exact(&mut back).map_err(|err| match err {
                ReadExactError::UnexpectedEof => Errno::ECONNRESET,
                ReadExactError::Other(err) => err,
            })?;
            Ok(back)
        })
    };
    for part in payload.chunks(chunk) {
        sock.write_all(part)?;
    }
    sock.flush()?;
    api.shutdown(fd, lwsock::Shutdown::Write)?;

    let back = reader.join().map_err(|_| "reader thread panicked")??;
    let echoed = server.join().map_err(|_| "server thread panicked")??;
    api.close(fd)?;
    api.close(listener)?;

    if back != payload {
        return Err("echoed bytes differ from what was sent".into());
    }
    let elapsed = started.elapsed();
    info!("echo: {} bytes in {:?}", echoed, elapsed);
    println!("echoed {} bytes in {:.3}s", echoed, elapsed.as_secs_f64());
    Ok(())
}

fn dgram(api: &Arc<SocketApi>, port: u16, count: usize) -> Result<(), Box<dyn Error>> {
    let rx = api.socket(AddressFamily::Inet, SockType::Datagram, 0)?;
    api.bind(rx, local(port))?;
    api.setsockopt(rx, lwsock::SockOpt::RecvTimeout(Some(Duration::from_secs(1))))?;
    let tx = api.socket(AddressFamily::Inet, SockType::Datagram, 0)?;

    let mut received = 0;
    let mut buf = [0u8; 64];
    for seq in 0..count {
        let msg = format!("datagram {}", seq);
        api.sendto(tx, msg.as_bytes(), MsgFlags::empty(), local(port))?;
        match api.recvfrom(rx, &mut buf, MsgFlags::empty()) {
            Ok((n, from)) => {
                debug!("dgram: {} bytes from {:?}", n, from);
                if &buf[..n] == msg.as_bytes() {
                    received += 1;
                }
            }
            Err(Errno::ETIMEDOUT) => info!("dgram: datagram {} lost", seq),
            Err(err) => return Err(err.into()),
        }
    }
    api.close(tx)?;
    api.close(rx)?;
    println!("{}/{} datagrams delivered", received, count);
    Ok(())
}

fn lookup(api: &SocketApi, name: &str, service: Option<&str>, family: Family) -> Result<(), Box<dyn Error>> {
    let hints = AddrInfoHints {
        family: family.into(),
        socktype: Some(SockType::Stream),
        flags: AiFlags::empty(),
    };
    for info in api.getaddrinfo(Some(name), service, &hints)? {
        println!("{} {:?} {}", name, info.family, info.addr);
    }
    Ok(())
}
