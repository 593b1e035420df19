// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use log::error;

use std::str::FromStr;
use std::time::Duration;

macro_rules! field_from_env {
    ($s: expr, $field: ident) => {
        let env_name = checker_config!(stringify!($field).to_uppercase());
        $s.$field = parse_env(&env_name);
    };
    ($s: expr, $field: ident, $d: expr) => {
        let env_name = checker_config!(stringify!($field).to_uppercase());
        $s.$field = parse_env(&env_name).unwrap_or($d);
    };
}

macro_rules! checker_config {
    ($s: expr) => {
        format!("COLLCHECK_{}", $s)
    };
}

/// Captured from the environment exactly once, inside session init, and
/// threaded through the session from there; no component consults the
/// environment afterwards.
#[derive(Debug, Default, Clone)]
pub struct Config {
    // Trace output
    pub trace_dir: String,

    // Flush policy
    pub flush_every_event: bool,
    pub flush_interval: Duration,

    // Forced dump on signal
    pub dump_signal: bool,
    pub dump_signal_number: usize,

    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        let mut s = Config::default();

        field_from_env!(s, trace_dir, String::from("/tmp"));

        field_from_env!(s, flush_every_event, false);
        field_from_env!(s, flush_interval, Duration::from_millis(250));

        field_from_env!(s, dump_signal, true);
        field_from_env!(s, dump_signal_number, libc::SIGUSR1 as usize);

        field_from_env!(s, log_level, String::from("info"));

        s
    }

    pub fn trace_path(&self, rank: i32) -> std::path::PathBuf {
        std::path::Path::new(&self.trace_dir).join(trace_file_name(rank))
    }
}

pub const TRACE_FILE_PREFIX: &str = "collcheck.";
pub const TRACE_FILE_SUFFIX: &str = ".trace";

pub fn trace_file_name(rank: i32) -> String {
    format!("{}{}{}", TRACE_FILE_PREFIX, rank, TRACE_FILE_SUFFIX)
}

/// Rank encoded in a trace file name, if the name follows the scheme.
pub fn rank_from_file_name(name: &str) -> Option<i32> {
    name.strip_prefix(TRACE_FILE_PREFIX)?
        .strip_suffix(TRACE_FILE_SUFFIX)?
        .parse()
        .ok()
}

trait FromConfigStr: Sized {
    type Err;
    fn parse(s: &str) -> Result<Self, Self::Err>;
}

// macro that implements FromConfigStr trait with FromStr
macro_rules! default_config_parser {
    ($t: tt) => {
        impl FromConfigStr for $t {
            type Err = <$t as FromStr>::Err;
            fn parse(s: &str) -> Result<Self, Self::Err> {
                <$t as FromStr>::from_str(s)
            }
        }
    };
}

default_config_parser!(String);
default_config_parser!(usize);

impl FromConfigStr for bool {
    type Err = String;
    fn parse(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_lowercase();
        const TRUE: &[&str] = &["true", "y", "yes", "1"];
        const FALSE: &[&str] = &["false", "n", "no", "0"];
        if TRUE.iter().any(|i| *i == s) {
            return Ok(true);
        }
        if FALSE.iter().any(|i| *i == s) {
            return Ok(false);
        }
        Err(format!("Could not parse {} to bool", s))
    }
}

mod duration_parser {
    use nom::{
        character::complete::{alpha1, digit1},
        combinator::map_res,
        multi::fold_many1,
        sequence::pair,
        IResult, Parser as _,
    };

    use std::time::Duration;

    fn parse_u64(input: &str) -> IResult<&str, u64> {
        map_res(digit1, |s: &str| s.parse::<u64>()).parse(input)
    }

    fn parse_duration_component(input: &str) -> IResult<&str, Duration> {
        let (input, (value, unit)) = pair(parse_u64, alpha1).parse(input)?;

        // Match the unit and create the corresponding Duration.
        match unit {
            "d" => Ok((input, Duration::from_secs(value * 24 * 60 * 60))),
            "h" => Ok((input, Duration::from_secs(value * 60 * 60))),
            "m" => Ok((input, Duration::from_secs(value * 60))),
            "s" => Ok((input, Duration::from_secs(value))),
            "ms" => Ok((input, Duration::from_millis(value))),
            "us" => Ok((input, Duration::from_micros(value))),
            "ns" => Ok((input, Duration::from_nanos(value))),
            _ => Err(nom::Err::Failure(nom::error::Error::new(
                unit,
                nom::error::ErrorKind::Tag,
            ))),
        }
    }

    pub fn parse(input: &str) -> IResult<&str, Duration> {
        let (remaining, maybe_dur) = fold_many1(
            parse_duration_component,
            || Ok(Duration::default()),
            |acc: Result<_, nom::Err<_>>, item| {
                acc?.checked_add(item).ok_or_else(|| {
                    nom::Err::Failure(nom::error::Error::new(
                        input,
                        nom::error::ErrorKind::TooLarge,
                    ))
                })
            },
        )
        .parse(input)?;
        Ok((remaining, maybe_dur?))
    }
}

impl FromConfigStr for std::time::Duration {
    type Err = String;
    fn parse(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_lowercase();
        if let Ok((remaining, dur)) = duration_parser::parse(&s) {
            if remaining.is_empty() {
                return Ok(dur);
            }
        }
        Err(format!("Could not parse {} to duration", s))
    }
}

fn parse_env<T>(name: &str) -> Option<T>
where
    T: FromConfigStr,
    <T as FromConfigStr>::Err: std::fmt::Debug,
{
    std::env::var(name).ok().and_then(|s| {
        T::parse(&s)
            .map_err(|e| {
                error!("Error parsing config {}, got error {:?}", name, e);
                e
            })
            .ok()
    })
}
