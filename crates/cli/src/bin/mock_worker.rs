//! Worker program speaking the fanout stdout protocol.
//!
//! Usage: `fanout-mock-worker <start> <end> [ok|fail|flaky|silent|hang]`
//!
//! `FANOUT_MOCK_DELAY_MS` slows down `ok` runs by sleeping after each item.

use std::thread::sleep;
use std::time::Duration;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Ok,
    Fail,
    Flaky,
    Silent,
    Hang,
}

impl Mode {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "ok" => Ok(Self::Ok),
            "fail" => Ok(Self::Fail),
            "flaky" => Ok(Self::Flaky),
            "silent" => Ok(Self::Silent),
            "hang" => Ok(Self::Hang),
            other => bail!("unknown mode: {}", other),
        }
    }
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 || args.len() > 3 {
        bail!("usage: fanout-mock-worker <start> <end> [ok|fail|flaky|silent|hang]");
    }

    let start: u64 = args[0].parse().context("invalid start index")?;
    let end: u64 = args[1].parse().context("invalid end index")?;
    if end < start {
        bail!("end index {} is before start index {}", end, start);
    }
    let mode = match args.get(2) {
        Some(mode) => Mode::parse(mode)?,
        None => Mode::Ok,
    };

    let attempt: u32 = std::env::var("FANOUT_ATTEMPT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);
    let delay = std::env::var("FANOUT_MOCK_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::ZERO);

    match mode {
        Mode::Ok => process(start, end, delay),
        Mode::Fail => fail(),
        Mode::Flaky if attempt <= 1 => fail(),
        Mode::Flaky => process(start, end, delay),
        Mode::Silent => Ok(()),
        Mode::Hang => {
            println!("STATUS: RUNNING");
            loop {
                sleep(Duration::from_secs(60));
            }
        }
    }
}

fn process(start: u64, end: u64, delay: Duration) -> Result<()> {
    println!("STATUS: RUNNING");
    println!("processing records {}..{}", start, end);

    for (done, index) in (start..end).enumerate() {
        println!("MESSAGE: Processing record {}", index);
        if !delay.is_zero() {
            sleep(delay);
        }
        println!("PROGRESS: {}", done + 1);
    }

    println!("STATUS: SUCCESS");
    Ok(())
}

fn fail() -> Result<()> {
    println!("STATUS: RUNNING");
    println!("This is an unrecognized log line 1");
    println!("This is an unrecognized log line 2");
    eprintln!("This is an error in stderr");
    println!("PROGRESS: 5");
    std::process::exit(1);
}
