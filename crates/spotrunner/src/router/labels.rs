//! Parsing of routing labels.
//!
//! A routing label has the form `<namespace>/<profile>[/<key>=<value>,...]`. Labels are
//! compared case-insensitively and the first routing label of a job wins.
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::char;
use nom::combinator::{map, opt, rest};
use nom::sequence::{preceded, separated_pair, tuple};

use crate::common::parser::{NomResult, consume_all, p_u32};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelOptions {
    pub cpu: Option<u32>,
    /// Memory in GB
    pub ram_gb: Option<u32>,
}

impl LabelOptions {
    pub fn is_empty(&self) -> bool {
        self.cpu.is_none() && self.ram_gb.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelRoute {
    pub profile: String,
    pub options: LabelOptions,
}

enum LabelOption {
    Cpu(u32),
    Ram(u32),
}

fn p_profile_name(input: &str) -> NomResult<&str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))(input)
}

fn p_option(input: &str) -> NomResult<LabelOption> {
    alt((
        map(separated_pair(tag("cpu"), char('='), p_u32), |(_, v)| {
            LabelOption::Cpu(v)
        }),
        map(separated_pair(tag("ram"), char('='), p_u32), |(_, v)| {
            LabelOption::Ram(v)
        }),
    ))(input)
}

/// Options are parsed one by one. Unknown keys and invalid or non-positive values are dropped.
fn parse_options(input: &str) -> LabelOptions {
    let mut options = LabelOptions::default();
    for item in input.split(',').map(|item| item.trim()) {
        match consume_all(p_option, item) {
            Ok(LabelOption::Cpu(value)) if value > 0 => options.cpu = Some(value),
            Ok(LabelOption::Ram(value)) if value > 0 => options.ram_gb = Some(value),
            Ok(_) => log::debug!("Ignoring non-positive label option `{item}`"),
            Err(_) => log::debug!("Ignoring label option `{item}`"),
        }
    }
    options
}

/// Parses a single (already lowercased) label.
fn p_route<'a>(namespace: &'a str) -> impl FnMut(&'a str) -> NomResult<'a, (&'a str, Option<&'a str>)> {
    map(
        tuple((
            tag(namespace),
            char('/'),
            p_profile_name,
            opt(preceded(char('/'), rest)),
        )),
        |(_, _, profile, options)| (profile, options),
    )
}

pub fn parse_label(label: &str, namespace: &str) -> Option<LabelRoute> {
    let label = label.trim().to_lowercase();
    let namespace = namespace.to_lowercase();
    let (profile, options) = consume_all(p_route(&namespace), &label).ok()?;
    Some(LabelRoute {
        profile: profile.to_string(),
        options: options.map(parse_options).unwrap_or_default(),
    })
}

/// Returns the route of the first routing label.
pub fn find_route<S: AsRef<str>>(labels: &[S], namespace: &str) -> Option<LabelRoute> {
    labels
        .iter()
        .find_map(|label| parse_label(label.as_ref(), namespace))
}
