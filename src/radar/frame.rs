//! Radar frame parsing cascade, §4.2: JSON → CSV → whitespace → bare
//! numeric, in that order. A frame matching none of the four shapes is
//! not an error — it is logged at debug and dropped by the caller.

use serde::Deserialize;

use super::units::SpeedUnit;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFrame {
    /// Sign preserved (direction); magnitude is `|signed_speed|`.
    pub signed_speed: f64,
    pub unit: SpeedUnit,
    pub magnitude: f64,
}

#[derive(Debug, Deserialize)]
struct JsonFrame {
    speed: Option<f64>,
    range: Option<f64>,
    unit: Option<String>,
    magnitude: Option<f64>,
}

/// Default unit for frames that carry a bare number with no declared
/// unit: the OPS243-family devices emit raw m/s on their unlabeled
/// output mode.
const DEFAULT_BARE_UNIT: SpeedUnit = SpeedUnit::MetersPerSecond;

pub fn parse_frame(line: &str) -> Option<ParsedFrame> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    parse_json(line)
        .or_else(|| parse_csv(line))
        .or_else(|| parse_whitespace(line))
        .or_else(|| parse_bare_numeric(line))
}

fn parse_json(line: &str) -> Option<ParsedFrame> {
    let frame: JsonFrame = serde_json::from_str(line).ok()?;
    let value = frame.speed.or(frame.range)?;
    let unit = frame
        .unit
        .as_deref()
        .and_then(SpeedUnit::from_token)
        .unwrap_or(DEFAULT_BARE_UNIT);
    Some(ParsedFrame {
        signed_speed: value,
        unit,
        magnitude: frame.magnitude.unwrap_or_else(|| value.abs()),
    })
}

/// `"<unit>",<value>` e.g. `"mph",25.5`.
fn parse_csv(line: &str) -> Option<ParsedFrame> {
    let (unit_part, value_part) = line.split_once(',')?;
    let unit_token = unit_part.trim().trim_matches('"');
    let unit = SpeedUnit::from_token(unit_token)?;
    let value: f64 = value_part.trim().parse().ok()?;
    Some(ParsedFrame {
        signed_speed: value,
        unit,
        magnitude: value.abs(),
    })
}

/// `<value> <unit>` e.g. `25.5 mph`.
fn parse_whitespace(line: &str) -> Option<ParsedFrame> {
    let mut parts = line.split_whitespace();
    let value_token = parts.next()?;
    let unit_token = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let value: f64 = value_token.parse().ok()?;
    let unit = SpeedUnit::from_token(unit_token)?;
    Some(ParsedFrame {
        signed_speed: value,
        unit,
        magnitude: value.abs(),
    })
}

fn parse_bare_numeric(line: &str) -> Option<ParsedFrame> {
    let value: f64 = line.parse().ok()?;
    Some(ParsedFrame {
        signed_speed: value,
        unit: DEFAULT_BARE_UNIT,
        magnitude: value.abs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_with_speed_field() {
        let frame = parse_frame(r#"{"speed": 25.5, "unit": "mph"}"#).unwrap();
        assert_eq!(frame.signed_speed, 25.5);
        assert_eq!(frame.unit, SpeedUnit::MilesPerHour);
    }

    #[test]
    fn parses_json_with_range_field() {
        let frame = parse_frame(r#"{"range": 3.2}"#).unwrap();
        assert_eq!(frame.signed_speed, 3.2);
        assert_eq!(frame.unit, SpeedUnit::MetersPerSecond);
    }

    #[test]
    fn parses_csv_unit_value() {
        let frame = parse_frame(r#""mph",25.5"#).unwrap();
        assert_eq!(frame.signed_speed, 25.5);
        assert_eq!(frame.unit, SpeedUnit::MilesPerHour);
    }

    #[test]
    fn parses_whitespace_value_unit() {
        let frame = parse_frame("20.0 m/s").unwrap();
        assert_eq!(frame.signed_speed, 20.0);
        assert_eq!(frame.unit, SpeedUnit::MetersPerSecond);
    }

    #[test]
    fn parses_bare_numeric_as_default_unit() {
        let frame = parse_frame("0.7").unwrap();
        assert_eq!(frame.signed_speed, 0.7);
        assert_eq!(frame.unit, SpeedUnit::MetersPerSecond);
    }

    #[test]
    fn unparsable_frame_is_none() {
        assert!(parse_frame("garbled;;;nonsense").is_none());
    }

    #[test]
    fn blank_line_is_none() {
        assert!(parse_frame("   ").is_none());
    }
}
