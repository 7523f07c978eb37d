//! Parameter values, their type descriptors and the string grammar.
//!
//! Integers accept decimal, hexadecimal (`0x` prefix) and octal (leading `0`)
//! text; booleans accept `true`/`false`; vectors use `[a, b, c]` and nest.

use serde::Deserialize;
use std::fmt;

/// How integer parameters are rendered back to text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayBase {
    #[default]
    Dec,
    Hex,
    Oct,
}

/// Type descriptor of a parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    Bool,
    Int { signed: bool, bits: u8 },
    Float { bits: u8 },
    Str,
    Vector(Box<ParamType>),
}

impl ParamType {
    /// Number of vector levels wrapped around the scalar type.
    pub fn dimensionality(&self) -> usize {
        match self {
            ParamType::Vector(inner) => 1 + inner.dimensionality(),
            _ => 0,
        }
    }

    pub fn name(&self) -> String {
        match self {
            ParamType::Bool => "bool".into(),
            ParamType::Int { signed: true, bits } => format!("i{bits}"),
            ParamType::Int { signed: false, bits } => format!("u{bits}"),
            ParamType::Float { bits } => format!("f{bits}"),
            ParamType::Str => "string".into(),
            ParamType::Vector(inner) => format!("vector<{}>", inner.name()),
        }
    }

    /// Parses `text` into a value of this type.
    pub fn parse(&self, text: &str) -> Result<ParamValue, String> {
        let text = text.trim();
        match self {
            ParamType::Bool => match text {
                "true" => Ok(ParamValue::Bool(true)),
                "false" => Ok(ParamValue::Bool(false)),
                other => Err(format!("'{other}' is not a boolean")),
            },
            ParamType::Int { signed, bits } => {
                if *signed {
                    let v = parse_signed(text)?;
                    check_signed_range(v, *bits)?;
                    Ok(ParamValue::Int(v))
                } else {
                    let v = parse_unsigned(text)?;
                    check_unsigned_range(v, *bits)?;
                    Ok(ParamValue::UInt(v))
                }
            }
            ParamType::Float { bits } => {
                let v: f64 = text
                    .parse()
                    .map_err(|_| format!("'{text}' is not a number"))?;
                Ok(ParamValue::Float(if *bits == 32 { v as f32 as f64 } else { v }))
            }
            ParamType::Str => Ok(ParamValue::Str(unquote(text).to_string())),
            ParamType::Vector(inner) => {
                let body = text
                    .strip_prefix('[')
                    .and_then(|t| t.strip_suffix(']'))
                    .ok_or_else(|| format!("'{text}' is not a vector"))?;
                let items = split_items(body)?;
                items
                    .into_iter()
                    .map(|item| inner.parse(item))
                    .collect::<Result<Vec<_>, _>>()
                    .map(ParamValue::Vector)
            }
        }
    }

    /// True if `value` has the shape this descriptor expects.
    pub fn accepts(&self, value: &ParamValue) -> bool {
        match (self, value) {
            (ParamType::Bool, ParamValue::Bool(_)) => true,
            (ParamType::Int { signed: true, bits }, ParamValue::Int(v)) => {
                check_signed_range(*v, *bits).is_ok()
            }
            (ParamType::Int { signed: false, bits }, ParamValue::UInt(v)) => {
                check_unsigned_range(*v, *bits).is_ok()
            }
            (ParamType::Float { .. }, ParamValue::Float(_)) => true,
            (ParamType::Str, ParamValue::Str(_)) => true,
            (ParamType::Vector(inner), ParamValue::Vector(items)) => {
                items.iter().all(|item| inner.accepts(item))
            }
            _ => false,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A tagged parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Vector(Vec<ParamValue>),
}

impl ParamValue {
    /// Renders the value in the canonical grammar, integers in `base`.
    pub fn render(&self, base: DisplayBase) -> String {
        match self {
            ParamValue::Bool(b) => b.to_string(),
            ParamValue::Int(v) => render_signed(*v, base),
            ParamValue::UInt(v) => render_unsigned(*v, base),
            ParamValue::Float(v) => v.to_string(),
            ParamValue::Str(s) => {
                if needs_quotes(s) {
                    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
                } else {
                    s.clone()
                }
            }
            ParamValue::Vector(items) => {
                let inner: Vec<String> = items.iter().map(|v| v.render(base)).collect();
                format!("[{}]", inner.join(", "))
            }
        }
    }

    /// Element at `indices` inside nested vectors.
    pub fn item_at(&self, indices: &[usize]) -> Option<&ParamValue> {
        let Some((first, rest)) = indices.split_first() else {
            return Some(self);
        };
        match self {
            ParamValue::Vector(items) => items.get(*first)?.item_at(rest),
            _ => None,
        }
    }
}

fn needs_quotes(s: &str) -> bool {
    s.is_empty()
        || s.trim() != s
        || s.contains([',', '[', ']', '#', '"'])
}

fn unquote(text: &str) -> String {
    match text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        Some(inner) => {
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else {
                    out.push(c);
                }
            }
            out
        }
        None => text.to_string(),
    }
}

/// Splits a vector body on top-level commas, honoring nesting and quotes.
fn split_items(body: &str) -> Result<Vec<&str>, String> {
    let mut items = Vec::new();
    if body.trim().is_empty() {
        return Ok(items);
    }
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in body.char_indices() {
        if in_quotes {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_quotes = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            '[' => depth += 1,
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| format!("unbalanced ']' in '{body}'"))?;
            }
            ',' if depth == 0 => {
                items.push(body[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 || in_quotes {
        return Err(format!("unterminated vector '{body}'"));
    }
    items.push(body[start..].trim());
    Ok(items)
}

fn parse_unsigned(text: &str) -> Result<u64, String> {
    let err = || format!("'{text}' is not an unsigned integer");
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|_| err())
    } else if text.len() > 1 && text.starts_with('0') {
        u64::from_str_radix(&text[1..], 8).map_err(|_| err())
    } else {
        text.parse().map_err(|_| err())
    }
}

fn parse_signed(text: &str) -> Result<i64, String> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let magnitude = parse_unsigned(digits).map_err(|_| format!("'{text}' is not an integer"))?;
    if negative {
        if magnitude == i64::MIN.unsigned_abs() {
            Ok(i64::MIN)
        } else {
            i64::try_from(magnitude)
                .map(|m| -m)
                .map_err(|_| format!("'{text}' is out of range"))
        }
    } else {
        i64::try_from(magnitude).map_err(|_| format!("'{text}' is out of range"))
    }
}

fn check_unsigned_range(v: u64, bits: u8) -> Result<(), String> {
    if bits >= 64 || v < (1u64 << bits) {
        Ok(())
    } else {
        Err(format!("{v} does not fit in u{bits}"))
    }
}

fn check_signed_range(v: i64, bits: u8) -> Result<(), String> {
    if bits >= 64 {
        return Ok(());
    }
    let max = (1i64 << (bits - 1)) - 1;
    let min = -(1i64 << (bits - 1));
    if (min..=max).contains(&v) {
        Ok(())
    } else {
        Err(format!("{v} does not fit in i{bits}"))
    }
}

fn render_unsigned(v: u64, base: DisplayBase) -> String {
    match base {
        DisplayBase::Dec => v.to_string(),
        DisplayBase::Hex => format!("{v:#x}"),
        DisplayBase::Oct if v == 0 => "0".into(),
        DisplayBase::Oct => format!("0{v:o}"),
    }
}

fn render_signed(v: i64, base: DisplayBase) -> String {
    if v < 0 && base != DisplayBase::Dec {
        format!("-{}", render_unsigned(v.unsigned_abs(), base))
    } else if v < 0 {
        v.to_string()
    } else {
        render_unsigned(v as u64, base)
    }
}

/// Conversion between Rust types and [`ParamValue`].
pub trait ParamConvert: Sized + 'static {
    fn param_type() -> ParamType;
    fn to_value(&self) -> ParamValue;
    fn from_value(value: &ParamValue) -> Option<Self>;
}

impl ParamConvert for bool {
    fn param_type() -> ParamType {
        ParamType::Bool
    }
    fn to_value(&self) -> ParamValue {
        ParamValue::Bool(*self)
    }
    fn from_value(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

macro_rules! unsigned_param {
    ($($t:ty => $bits:expr),*) => {$(
        impl ParamConvert for $t {
            fn param_type() -> ParamType {
                ParamType::Int { signed: false, bits: $bits }
            }
            fn to_value(&self) -> ParamValue {
                ParamValue::UInt(*self as u64)
            }
            fn from_value(value: &ParamValue) -> Option<Self> {
                match value {
                    ParamValue::UInt(v) => <$t>::try_from(*v).ok(),
                    _ => None,
                }
            }
        }
    )*};
}

macro_rules! signed_param {
    ($($t:ty => $bits:expr),*) => {$(
        impl ParamConvert for $t {
            fn param_type() -> ParamType {
                ParamType::Int { signed: true, bits: $bits }
            }
            fn to_value(&self) -> ParamValue {
                ParamValue::Int(*self as i64)
            }
            fn from_value(value: &ParamValue) -> Option<Self> {
                match value {
                    ParamValue::Int(v) => <$t>::try_from(*v).ok(),
                    _ => None,
                }
            }
        }
    )*};
}

unsigned_param!(u8 => 8, u16 => 16, u32 => 32, u64 => 64);
signed_param!(i8 => 8, i16 => 16, i32 => 32, i64 => 64);

impl ParamConvert for f64 {
    fn param_type() -> ParamType {
        ParamType::Float { bits: 64 }
    }
    fn to_value(&self) -> ParamValue {
        ParamValue::Float(*self)
    }
    fn from_value(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl ParamConvert for f32 {
    fn param_type() -> ParamType {
        ParamType::Float { bits: 32 }
    }
    fn to_value(&self) -> ParamValue {
        ParamValue::Float(*self as f64)
    }
    fn from_value(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Float(v) => Some(*v as f32),
            _ => None,
        }
    }
}

impl ParamConvert for String {
    fn param_type() -> ParamType {
        ParamType::Str
    }
    fn to_value(&self) -> ParamValue {
        ParamValue::Str(self.clone())
    }
    fn from_value(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Str(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl<T: ParamConvert> ParamConvert for Vec<T> {
    fn param_type() -> ParamType {
        ParamType::Vector(Box::new(T::param_type()))
    }
    fn to_value(&self) -> ParamValue {
        ParamValue::Vector(self.iter().map(ParamConvert::to_value).collect())
    }
    fn from_value(value: &ParamValue) -> Option<Self> {
        match value {
            ParamValue::Vector(items) => items.iter().map(T::from_value).collect(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canon(ty: &ParamType, text: &str, base: DisplayBase) -> String {
        ty.parse(text).unwrap().render(base)
    }

    #[test]
    fn integers_accept_all_bases() {
        let ty = u32::param_type();
        assert_eq!(canon(&ty, "0x10", DisplayBase::Dec), "16");
        assert_eq!(canon(&ty, "017", DisplayBase::Dec), "15");
        assert_eq!(canon(&ty, "0", DisplayBase::Dec), "0");
        assert_eq!(canon(&ty, "255", DisplayBase::Hex), "0xff");
        assert_eq!(canon(&ty, "8", DisplayBase::Oct), "010");
    }

    #[test]
    fn integer_ranges_are_enforced() {
        assert!(u8::param_type().parse("256").is_err());
        assert!(i8::param_type().parse("-128").is_ok());
        assert!(i8::param_type().parse("128").is_err());
        assert!(u64::param_type().parse("-1").is_err());
        assert_eq!(i64::param_type().parse("-0x10").unwrap(), ParamValue::Int(-16));
    }

    #[test]
    fn booleans_are_strict() {
        assert_eq!(bool::param_type().parse("true").unwrap(), ParamValue::Bool(true));
        assert!(bool::param_type().parse("yes").is_err());
    }

    #[test]
    fn nested_vectors_parse_and_render() {
        let ty = Vec::<Vec<u32>>::param_type();
        assert_eq!(ty.dimensionality(), 2);
        let v = ty.parse("[[1, 2], [], [0x3]]").unwrap();
        assert_eq!(v.render(DisplayBase::Dec), "[[1, 2], [], [3]]");
        assert_eq!(v.item_at(&[2, 0]), Some(&ParamValue::UInt(3)));
        assert!(ty.parse("[[1, 2]").is_err());
    }

    #[test]
    fn strings_round_trip_through_quotes() {
        let ty = Vec::<String>::param_type();
        let v = ty.parse("[plain, \"with, comma\"]").unwrap();
        assert_eq!(v.render(DisplayBase::Dec), "[plain, \"with, comma\"]");
        let back = Vec::<String>::from_value(&v).unwrap();
        assert_eq!(back, vec!["plain".to_string(), "with, comma".to_string()]);
    }

    #[test]
    fn typed_conversion_checks_width() {
        assert_eq!(u8::from_value(&ParamValue::UInt(300)), None);
        assert_eq!(u16::from_value(&ParamValue::UInt(300)), Some(300));
        assert_eq!(i32::from_value(&ParamValue::UInt(1)), None);
    }
}
