use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::time::{Duration, sleep};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pacer_core::{
    AsyncQueuer, AsyncQueuerOptions, Backoff, Batcher, BatcherOptions, Debouncer, DebouncerOptions, QueuePosition,
    RateLimiter, RateLimiterOptions, Retryer, RetryerOptions, Throttler, ThrottlerOptions, WindowType,
};

#[derive(Parser)]
#[command(name = "pacer")]
#[command(about = "Replays a synthetic call stream through an execution-control primitive")]
struct Args {
    #[command(subcommand)]
    scenario: Scenario,
}

/// Call stream shared by the edge-triggered scenarios.
#[derive(clap::Args, Debug, Clone, Copy)]
struct Stream {
    /// Number of calls to make
    #[arg(long, default_value = "10")]
    calls: u32,

    /// Pause between calls
    #[arg(long, default_value = "30")]
    interval_ms: u64,
}

#[derive(Subcommand)]
enum Scenario {
    /// Collapse a burst of calls into one trailing (or leading) execution
    Debounce {
        #[command(flatten)]
        stream: Stream,
        #[arg(long, default_value = "100")]
        wait_ms: u64,
        /// Also execute on the leading edge
        #[arg(long)]
        leading: bool,
    },
    /// Run at most once per wait
    Throttle {
        #[command(flatten)]
        stream: Stream,
        #[arg(long, default_value = "100")]
        wait_ms: u64,
        /// Skip the trailing execution
        #[arg(long)]
        no_trailing: bool,
    },
    /// Cap executions per window and report rejections
    RateLimit {
        #[command(flatten)]
        stream: Stream,
        #[arg(long, default_value = "5")]
        limit: u32,
        #[arg(long, default_value = "200")]
        window_ms: u64,
        #[arg(long, value_enum, default_value = "fixed")]
        window: Window,
    },
    /// Drain items through an async worker pool
    Queue {
        #[arg(long, default_value = "6")]
        items: u32,
        #[arg(long, default_value = "2")]
        concurrency: usize,
        /// Pause a slot between items
        #[arg(long, default_value = "0")]
        wait_ms: u64,
        /// Simulated work per item
        #[arg(long, default_value = "50")]
        work_ms: u64,
        /// Take the newest item first
        #[arg(long)]
        lifo: bool,
    },
    /// Group items and flush on size or timer
    Batch {
        #[command(flatten)]
        stream: Stream,
        #[arg(long, default_value = "4")]
        max_size: usize,
        #[arg(long, default_value = "100")]
        wait_ms: u64,
    },
    /// Retry an operation that fails a given number of times
    Retry {
        /// Failures before the operation succeeds
        #[arg(long, default_value = "2")]
        failures: u32,
        #[arg(long, default_value = "3")]
        max_attempts: u32,
        #[arg(long, default_value = "100")]
        base_wait_ms: u64,
        #[arg(long, value_enum, default_value = "exponential")]
        backoff: BackoffArg,
        #[arg(long, default_value = "0")]
        jitter: f64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Window {
    Fixed,
    Sliding,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BackoffArg {
    Fixed,
    Linear,
    Exponential,
}

impl From<BackoffArg> for Backoff {
    fn from(arg: BackoffArg) -> Self {
        match arg {
            BackoffArg::Fixed => Backoff::Fixed,
            BackoffArg::Linear => Backoff::Linear,
            BackoffArg::Exponential => Backoff::Exponential,
        }
    }
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn print_state<S: Serialize>(state: &S) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(state)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Args::parse().scenario {
        Scenario::Debounce {
            stream,
            wait_ms,
            leading,
        } => {
            let debouncer = Debouncer::new(
                |n: u32| info!(call = n, "debounced execution"),
                DebouncerOptions::new(ms(wait_ms)).leading(leading),
            );
            for n in 0..stream.calls {
                debouncer.maybe_execute(n);
                sleep(ms(stream.interval_ms)).await;
            }
            sleep(ms(wait_ms)).await;
            print_state(&debouncer.state())?;
        }
        Scenario::Throttle {
            stream,
            wait_ms,
            no_trailing,
        } => {
            let throttler = Throttler::new(
                |n: u32| info!(call = n, "throttled execution"),
                ThrottlerOptions::new(ms(wait_ms)).trailing(!no_trailing),
            );
            for n in 0..stream.calls {
                throttler.maybe_execute(n);
                sleep(ms(stream.interval_ms)).await;
            }
            sleep(ms(wait_ms)).await;
            print_state(&throttler.state())?;
        }
        Scenario::RateLimit {
            stream,
            limit,
            window_ms,
            window,
        } => {
            let window_type = match window {
                Window::Fixed => WindowType::Fixed,
                Window::Sliding => WindowType::Sliding,
            };
            let limiter = RateLimiter::new(
                |n: u32| info!(call = n, "rate limited execution"),
                RateLimiterOptions::new(limit, ms(window_ms))
                    .window_type(window_type)
                    .on_reject(|r| info!(retry_in_ms = r.ms_until_next_window, "rejected")),
            );
            for n in 0..stream.calls {
                limiter.maybe_execute(n);
                sleep(ms(stream.interval_ms)).await;
            }
            print_state(&limiter.state())?;
        }
        Scenario::Queue {
            items,
            concurrency,
            wait_ms,
            work_ms,
            lifo,
        } => {
            let from = if lifo { QueuePosition::Back } else { QueuePosition::Front };
            let queuer = AsyncQueuer::new(
                move |n: u32| async move {
                    info!(item = n, "processing");
                    sleep(ms(work_ms)).await;
                    Ok::<_, String>(n * 2)
                },
                AsyncQueuerOptions::default()
                    .concurrency(concurrency)
                    .wait(ms(wait_ms))
                    .get_items_from(from)
                    .started(false)
                    .on_success(|r| info!(result = r, "processed")),
            );
            for n in 0..items {
                queuer.add_item(n);
            }
            queuer.start();
            while !queuer.state().is_empty || queuer.state().active_count > 0 {
                sleep(ms(10)).await;
            }
            print_state(&queuer.state())?;
        }
        Scenario::Batch {
            stream,
            max_size,
            wait_ms,
        } => {
            let batcher = Batcher::new(
                |batch: Vec<u32>| info!(?batch, "batch flushed"),
                BatcherOptions::default().max_size(max_size).wait(ms(wait_ms)),
            );
            for n in 0..stream.calls {
                batcher.add_item(n);
                sleep(ms(stream.interval_ms)).await;
            }
            sleep(ms(wait_ms)).await;
            print_state(&batcher.state())?;
        }
        Scenario::Retry {
            failures,
            max_attempts,
            base_wait_ms,
            backoff,
            jitter,
        } => {
            let left = Arc::new(AtomicU32::new(failures));
            let retryer = Retryer::new(
                move |()| {
                    let left = Arc::clone(&left);
                    async move {
                        match left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
                            Ok(n) => Err(format!("intentional failure (left={n})")),
                            Err(_) => Ok("done"),
                        }
                    }
                },
                RetryerOptions::new()
                    .max_attempts(max_attempts)
                    .backoff(backoff.into())
                    .base_wait(ms(base_wait_ms))
                    .jitter(jitter)
                    .on_retry(|attempt, err| info!(attempt, error = %err, "retrying")),
            );
            match retryer.execute(()).await {
                Ok(value) => info!(?value, "retry finished"),
                Err(err) => info!(error = %err, "gave up"),
            }
            print_state(&retryer.state())?;
        }
    }
    Ok(())
}
