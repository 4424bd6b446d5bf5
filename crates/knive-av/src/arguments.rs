//! Translation of encoder option maps into command-line arguments.
//!
//! Options are kept in a `BTreeMap`, so the produced argument vector is
//! ordered by option name and identical for identical input.

use std::collections::BTreeMap;

use knive_core::config::{ArgValue, QualityConfig};

/// Option name to value. `None` is a bare flag such as `-vn`.
pub type EncoderOptions = BTreeMap<String, Option<ArgValue>>;

/// Frame rate assumed when the options do not set `r`.
pub const DEFAULT_TARGET_FPS: f64 = 25.0;

/// Build the option part of an encoder command line.
///
/// - `None` and `true` emit the flag alone
/// - `false` omits the option
/// - a list repeats the flag once per element
/// - anything else emits the flag followed by its value
pub fn encoder_args(options: &EncoderOptions) -> Vec<String> {
    let mut args = Vec::new();
    for (key, value) in options {
        let flag = if key.starts_with('-') {
            key.clone()
        } else {
            format!("-{key}")
        };
        match value {
            None | Some(ArgValue::Flag(true)) => args.push(flag),
            Some(ArgValue::Flag(false)) => {}
            Some(ArgValue::List(items)) => {
                for item in items {
                    args.push(flag.clone());
                    args.push(item.to_string());
                }
            }
            Some(scalar) => {
                args.push(flag);
                args.push(scalar.to_string());
            }
        }
    }
    args
}

/// Full transcoder arguments: read stdin, write stdout.
pub fn transcoder_args(options: &EncoderOptions) -> Vec<String> {
    let mut args: Vec<String> = ["-y", "-i", "-"].iter().map(|s| s.to_string()).collect();
    args.extend(encoder_args(options));
    args.push("-".into());
    args
}

/// The frame rate the encoder is asked to produce.
pub fn target_fps(options: &EncoderOptions) -> f64 {
    match options.get("r") {
        Some(Some(ArgValue::Integer(r))) => *r as f64,
        Some(Some(ArgValue::Float(r))) => *r,
        Some(Some(ArgValue::Text(r))) => r.parse().unwrap_or(DEFAULT_TARGET_FPS),
        _ => DEFAULT_TARGET_FPS,
    }
}

/// Encoder options of a quality section; metadata fields are not options.
pub fn quality_options(quality: &QualityConfig) -> EncoderOptions {
    quality
        .encoder
        .iter()
        .map(|(k, v)| (k.clone(), Some(v.clone())))
        .collect()
}
