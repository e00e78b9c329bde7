//! tether-host demo
//!
//! 1. Opens one host context and exports `Counter`
//! 2. Worker threads dispatch increments onto the host thread
//! 3. A producer thread streams ticks, relayed into the same context
//! 4. Drives the loop until every worker is done and nothing is pending

use std::process::ExitCode;
use std::thread::JoinHandle;

use tether_host::runtime::logging;
use tether_host::{
    wrapper, ContextRegistry, Counter, Env, Host, Relay, RuntimeConfig, Stream, Subscriber, Value,
};

struct Options {
    workers: usize,
    ticks: usize,
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options {
        workers: 4,
        ticks: 100,
    };
    let mut iter = args.iter().skip(1);
    while let Some(flag) = iter.next() {
        let target = match flag.as_str() {
            "--workers" => &mut options.workers,
            "--ticks" => &mut options.ticks,
            "--help" | "-h" => return Err(String::new()),
            other => return Err(format!("unknown argument `{other}`")),
        };
        let value = iter
            .next()
            .ok_or_else(|| format!("{flag} needs a value"))?;
        *target = value
            .parse()
            .map_err(|_| format!("{flag}: `{value}` is not a number"))?;
    }
    Ok(options)
}

fn usage() {
    eprintln!("Usage: tether-host [--workers N] [--ticks N]");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  TETHER_LOG              tracing filter directives");
    eprintln!("  TETHER_DEBUG=1          debug logging when TETHER_LOG is unset");
    eprintln!("  TETHER_STRICT_IDENTITY  reuse live proxies for the same handle");
    eprintln!("  TETHER_POLL_MS          host loop poll interval");
}

fn increment_counter(env: &Env) {
    let Some(counter) = env.global("counter") else {
        return;
    };
    if let Err(err) = env.call(&counter, "increment", &[]) {
        tracing::warn!(%err, "increment failed");
    }
}

fn run(options: &Options) -> Result<(), Box<dyn std::error::Error>> {
    let config = RuntimeConfig::from_env();
    logging::init(&config);

    let registry = ContextRegistry::with_config(config);
    let host = Host::open(&registry)?;
    let constructor = Value::Function(wrapper::export::<Counter>(&host)?);
    let counter = host.call(&constructor, "create", &[Value::from(0.0)])?;
    host.set_global("counter", counter.clone());

    let ticks = Stream::<u64>::new();
    let _subscriber = Subscriber::join(
        &ticks,
        Relay::new(host.remote(), |env: &Env, _tick: u64| increment_counter(env)).on_closed(
            |_env, error| match error {
                Some(error) => tracing::warn!(error, "tick stream crashed"),
                None => tracing::info!("tick stream finished"),
            },
        ),
    )?;

    let mut threads: Vec<JoinHandle<()>> = (0..options.workers)
        .map(|_| {
            let remote = host.remote();
            let count = options.ticks;
            std::thread::spawn(move || {
                for _ in 0..count {
                    if remote.dispatch(increment_counter).is_err() {
                        break;
                    }
                }
            })
        })
        .collect();
    threads.push({
        let ticks = ticks.clone();
        let count = options.ticks as u64;
        std::thread::spawn(move || {
            for tick in 0..count {
                ticks.push(tick);
            }
            ticks.close();
        })
    });
    drop(ticks);

    let poll = host.config().poll_interval;
    let mut ran = 0;
    while !threads.iter().all(JoinHandle::is_finished) || host.is_alive() {
        ran += host.turn(poll);
    }
    for thread in threads {
        thread.join().map_err(|_| "worker thread panicked")?;
    }
    ran += host.drain();

    let value = host.get(&counter, "value")?;
    let text = host.call(&counter, "toString", &[])?;
    println!("=== tether-host ===");
    println!("Workers:     {}", options.workers);
    println!("Ticks:       {}", options.ticks);
    println!("Tasks run:   {ran}");
    println!("Counter:     {}", value.as_number().unwrap_or_default());
    println!("Described:   {}", text.as_str().unwrap_or_default());

    host.call(&counter, "destroy", &[])?;
    match host.get(&counter, "value") {
        Ok(_) => println!("After destroy: value still readable (unexpected)"),
        Err(err) => println!("After destroy: {err}"),
    }
    Ok(())
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(message) => {
            if !message.is_empty() {
                eprintln!("error: {message}");
            }
            usage();
            return ExitCode::from(2);
        }
    };

    match run(&options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
