//! Physical quantities: a small unit registry covering the dimensions
//! recorded by lab protocols, with normalization to one default unit per kind.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::QuoremError;

/// Exponents of length, mass, time, temperature and amount of substance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Dimension(pub [i8; 5]);

impl Dimension {
    pub const NONE: Dimension = Dimension([0, 0, 0, 0, 0]);

    fn combine(self, other: Dimension, power: i8) -> Dimension {
        let mut out = self.0;
        for (slot, exp) in out.iter_mut().zip(other.0) {
            *slot += exp * power;
        }
        Dimension(out)
    }
}

/// A unit expressed against SI base units: `si = magnitude * factor + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub factor: f64,
    pub offset: f64,
    pub dimension: Dimension,
}

impl Unit {
    const fn new(factor: f64, dimension: [i8; 5]) -> Self {
        Self {
            factor,
            offset: 0.0,
            dimension: Dimension(dimension),
        }
    }

    const fn offset(factor: f64, offset: f64, dimension: [i8; 5]) -> Self {
        Self {
            factor,
            offset,
            dimension: Dimension(dimension),
        }
    }

    pub fn si(dimension: Dimension) -> Self {
        Self {
            factor: 1.0,
            offset: 0.0,
            dimension,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub magnitude: f64,
    pub unit: Unit,
}

impl Quantity {
    pub fn to_si(&self) -> f64 {
        self.magnitude * self.unit.factor + self.unit.offset
    }

    pub fn convert_to(&self, target: &Unit) -> Result<f64, QuoremError> {
        if self.unit.dimension != target.dimension {
            return Err(QuoremError::cast(
                "quantity",
                format!("{:?}", self.unit.dimension),
                "incompatible dimensions",
            ));
        }
        Ok((self.to_si() - target.offset) / target.factor)
    }
}

impl FromStr for Quantity {
    type Err = QuoremError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_quantity(value)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum QuantityKind {
    Volume,
    Concentration,
    Mass,
    Temperature,
    Time,
    Length,
    Frequency,
    Velocity,
    Energy,
    Pressure,
    Viscosity,
}

impl QuantityKind {
    pub const ALL: [QuantityKind; 11] = [
        QuantityKind::Volume,
        QuantityKind::Concentration,
        QuantityKind::Mass,
        QuantityKind::Temperature,
        QuantityKind::Time,
        QuantityKind::Length,
        QuantityKind::Frequency,
        QuantityKind::Velocity,
        QuantityKind::Energy,
        QuantityKind::Pressure,
        QuantityKind::Viscosity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QuantityKind::Volume => "volume",
            QuantityKind::Concentration => "concentration",
            QuantityKind::Mass => "mass",
            QuantityKind::Temperature => "temperature",
            QuantityKind::Time => "time",
            QuantityKind::Length => "length",
            QuantityKind::Frequency => "frequency",
            QuantityKind::Velocity => "velocity",
            QuantityKind::Energy => "energy",
            QuantityKind::Pressure => "pressure",
            QuantityKind::Viscosity => "viscosity",
        }
    }

    pub fn default_unit_name(self) -> &'static str {
        match self {
            QuantityKind::Volume => "litre",
            QuantityKind::Concentration => "molar",
            QuantityKind::Mass => "gram",
            QuantityKind::Temperature => "celsius",
            QuantityKind::Time => "second",
            QuantityKind::Length => "metre",
            QuantityKind::Frequency => "hertz",
            QuantityKind::Velocity => "metre/second",
            QuantityKind::Energy => "calorie",
            QuantityKind::Pressure => "pascal",
            QuantityKind::Viscosity => "poise",
        }
    }

    pub fn default_unit(self) -> Unit {
        match self {
            QuantityKind::Volume => Unit::new(1e-3, [3, 0, 0, 0, 0]),
            QuantityKind::Concentration => Unit::new(1e3, [-3, 0, 0, 0, 1]),
            QuantityKind::Mass => Unit::new(1e-3, [0, 1, 0, 0, 0]),
            QuantityKind::Temperature => Unit::offset(1.0, 273.15, [0, 0, 0, 1, 0]),
            QuantityKind::Time => Unit::new(1.0, [0, 0, 1, 0, 0]),
            QuantityKind::Length => Unit::new(1.0, [1, 0, 0, 0, 0]),
            QuantityKind::Frequency => Unit::new(1.0, [0, 0, -1, 0, 0]),
            QuantityKind::Velocity => Unit::new(1.0, [1, 0, -1, 0, 0]),
            QuantityKind::Energy => Unit::new(4.184, [2, 1, -2, 0, 0]),
            QuantityKind::Pressure => Unit::new(1.0, [-1, 1, -2, 0, 0]),
            QuantityKind::Viscosity => Unit::new(0.1, [-1, 1, -1, 0, 0]),
        }
    }

    pub fn dimension(self) -> Dimension {
        self.default_unit().dimension
    }

    /// Every kind whose dimensionality is exactly `dimension`.
    pub fn matching(dimension: Dimension) -> Vec<QuantityKind> {
        QuantityKind::ALL
            .into_iter()
            .filter(|kind| kind.dimension() == dimension)
            .collect()
    }

    /// Magnitude of `quantity` expressed in this kind's default unit.
    pub fn normalize(self, quantity: &Quantity) -> Result<f64, QuoremError> {
        quantity
            .convert_to(&self.default_unit())
            .map_err(|_| QuoremError::cast(self.as_str(), describe(quantity), "wrong dimensionality"))
    }
}

impl fmt::Display for QuantityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn describe(quantity: &Quantity) -> String {
    format!("{} ({:?})", quantity.magnitude, quantity.unit.dimension.0)
}

const L: [i8; 5] = [1, 0, 0, 0, 0];
const M: [i8; 5] = [0, 1, 0, 0, 0];
const T: [i8; 5] = [0, 0, 1, 0, 0];
const K: [i8; 5] = [0, 0, 0, 1, 0];
const N: [i8; 5] = [0, 0, 0, 0, 1];
const VOLUME: [i8; 5] = [3, 0, 0, 0, 0];
const MOLARITY: [i8; 5] = [-3, 0, 0, 0, 1];
const FREQUENCY: [i8; 5] = [0, 0, -1, 0, 0];
const ENERGY: [i8; 5] = [2, 1, -2, 0, 0];
const PRESSURE: [i8; 5] = [-1, 1, -2, 0, 0];
const VISCOSITY: [i8; 5] = [-1, 1, -1, 0, 0];

/// Symbols that accept SI prefixes.
const PREFIXABLE: &[(&str, Unit)] = &[
    ("m", Unit::new(1.0, L)),
    ("g", Unit::new(1e-3, M)),
    ("s", Unit::new(1.0, T)),
    ("K", Unit::new(1.0, K)),
    ("mol", Unit::new(1.0, N)),
    ("L", Unit::new(1e-3, VOLUME)),
    ("l", Unit::new(1e-3, VOLUME)),
    ("M", Unit::new(1e3, MOLARITY)),
    ("Hz", Unit::new(1.0, FREQUENCY)),
    ("J", Unit::new(1.0, ENERGY)),
    ("cal", Unit::new(4.184, ENERGY)),
    ("Pa", Unit::new(1.0, PRESSURE)),
    ("P", Unit::new(0.1, VISCOSITY)),
    ("metre", Unit::new(1.0, L)),
    ("meter", Unit::new(1.0, L)),
    ("gram", Unit::new(1e-3, M)),
    ("second", Unit::new(1.0, T)),
    ("mole", Unit::new(1.0, N)),
    ("litre", Unit::new(1e-3, VOLUME)),
    ("liter", Unit::new(1e-3, VOLUME)),
    ("molar", Unit::new(1e3, MOLARITY)),
    ("hertz", Unit::new(1.0, FREQUENCY)),
    ("joule", Unit::new(1.0, ENERGY)),
    ("calorie", Unit::new(4.184, ENERGY)),
    ("pascal", Unit::new(1.0, PRESSURE)),
    ("poise", Unit::new(0.1, VISCOSITY)),
];

const UNPREFIXED: &[(&str, Unit)] = &[
    ("min", Unit::new(60.0, T)),
    ("minute", Unit::new(60.0, T)),
    ("h", Unit::new(3600.0, T)),
    ("hr", Unit::new(3600.0, T)),
    ("hour", Unit::new(3600.0, T)),
    ("d", Unit::new(86400.0, T)),
    ("day", Unit::new(86400.0, T)),
    ("week", Unit::new(604800.0, T)),
    ("sec", Unit::new(1.0, T)),
    ("kelvin", Unit::new(1.0, K)),
    ("degC", Unit::offset(1.0, 273.15, K)),
    ("°C", Unit::offset(1.0, 273.15, K)),
    ("celsius", Unit::offset(1.0, 273.15, K)),
    ("degree_Celsius", Unit::offset(1.0, 273.15, K)),
    ("degF", Unit::offset(5.0 / 9.0, 255.372_222_222_222_2, K)),
    ("°F", Unit::offset(5.0 / 9.0, 255.372_222_222_222_2, K)),
    ("fahrenheit", Unit::offset(5.0 / 9.0, 255.372_222_222_222_2, K)),
    ("in", Unit::new(0.0254, L)),
    ("inch", Unit::new(0.0254, L)),
    ("ft", Unit::new(0.3048, L)),
    ("foot", Unit::new(0.3048, L)),
    ("feet", Unit::new(0.3048, L)),
    ("mi", Unit::new(1609.344, L)),
    ("mile", Unit::new(1609.344, L)),
    ("angstrom", Unit::new(1e-10, L)),
    ("Å", Unit::new(1e-10, L)),
    ("t", Unit::new(1e3, M)),
    ("tonne", Unit::new(1e3, M)),
    ("lb", Unit::new(0.453_592_37, M)),
    ("pound", Unit::new(0.453_592_37, M)),
    ("oz", Unit::new(0.028_349_523_125, M)),
    ("rpm", Unit::new(1.0 / 60.0, FREQUENCY)),
    ("bar", Unit::new(1e5, PRESSURE)),
    ("atm", Unit::new(101_325.0, PRESSURE)),
    ("psi", Unit::new(6_894.757_293_168, PRESSURE)),
    ("mmHg", Unit::new(133.322_387_415, PRESSURE)),
    ("torr", Unit::new(133.322_368_421, PRESSURE)),
    ("eV", Unit::new(1.602_176_634e-19, ENERGY)),
];

const PREFIXES: &[(&str, f64)] = &[
    ("Y", 1e24),
    ("Z", 1e21),
    ("E", 1e18),
    ("P", 1e15),
    ("T", 1e12),
    ("G", 1e9),
    ("M", 1e6),
    ("k", 1e3),
    ("h", 1e2),
    ("da", 1e1),
    ("d", 1e-1),
    ("c", 1e-2),
    ("m", 1e-3),
    ("u", 1e-6),
    ("µ", 1e-6),
    ("μ", 1e-6),
    ("n", 1e-9),
    ("p", 1e-12),
    ("f", 1e-15),
    ("a", 1e-18),
];

const PREFIX_NAMES: &[(&str, f64)] = &[
    ("giga", 1e9),
    ("mega", 1e6),
    ("kilo", 1e3),
    ("hecto", 1e2),
    ("deca", 1e1),
    ("deci", 1e-1),
    ("centi", 1e-2),
    ("milli", 1e-3),
    ("micro", 1e-6),
    ("nano", 1e-9),
    ("pico", 1e-12),
    ("femto", 1e-15),
];

fn lookup_symbol(symbol: &str) -> Option<Unit> {
    let singular = |name: &str| -> Option<Unit> {
        let exact = PREFIXABLE
            .iter()
            .chain(UNPREFIXED)
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, unit)| *unit);
        if exact.is_some() {
            return exact;
        }
        for (prefix, scale) in PREFIXES.iter().chain(PREFIX_NAMES) {
            if let Some(rest) = name.strip_prefix(prefix) {
                if let Some((_, unit)) = PREFIXABLE.iter().find(|(candidate, _)| *candidate == rest)
                {
                    return Some(Unit {
                        factor: unit.factor * scale,
                        ..*unit
                    });
                }
            }
        }
        None
    };
    singular(symbol).or_else(|| {
        symbol
            .strip_suffix("es")
            .filter(|stem| stem.len() > 3)
            .and_then(singular)
            .or_else(|| symbol.strip_suffix('s').filter(|stem| stem.len() > 2).and_then(singular))
    })
}

/// Parses a unit expression such as `mL`, `kg*m/s^2` or `metres per second`.
pub fn parse_unit(expression: &str) -> Result<Unit, QuoremError> {
    let normalized = expression
        .replace("**", "^")
        .replace('·', "*")
        .replace(" per ", " / ");
    let mut factor = 1.0;
    let mut dimension = Dimension::NONE;
    let mut offset = None;
    let mut terms = 0;
    let mut divide_next = false;

    for token in tokenize(&normalized) {
        match token {
            "*" => continue,
            "/" => {
                divide_next = true;
                continue;
            }
            _ => {}
        }
        let (symbol, exponent) = split_exponent(token)
            .ok_or_else(|| QuoremError::UnknownUnit(expression.to_string()))?;
        let unit =
            lookup_symbol(symbol).ok_or_else(|| QuoremError::UnknownUnit(expression.to_string()))?;
        let power = if divide_next { -exponent } else { exponent };
        divide_next = false;
        if unit.offset != 0.0 {
            offset = Some((unit.offset, power));
        }
        factor *= unit.factor.powi(i32::from(power));
        dimension = dimension.combine(unit.dimension, power);
        terms += 1;
    }

    if terms == 0 {
        return Err(QuoremError::UnknownUnit(expression.to_string()));
    }
    match offset {
        Some((value, 1)) if terms == 1 => Ok(Unit {
            factor,
            offset: value,
            dimension,
        }),
        Some(_) => Err(QuoremError::UnknownUnit(format!(
            "{expression}: offset units cannot be combined"
        ))),
        None => Ok(Unit {
            factor,
            offset: 0.0,
            dimension,
        }),
    }
}

fn tokenize(expression: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = None;
    for (index, ch) in expression.char_indices() {
        if ch == '*' || ch == '/' || ch.is_whitespace() {
            if let Some(begin) = start.take() {
                tokens.push(&expression[begin..index]);
            }
            if !ch.is_whitespace() {
                tokens.push(&expression[index..index + ch.len_utf8()]);
            }
        } else if start.is_none() {
            start = Some(index);
        }
    }
    if let Some(begin) = start {
        tokens.push(&expression[begin..]);
    }
    tokens
}

fn split_exponent(token: &str) -> Option<(&str, i8)> {
    if let Some((symbol, exponent)) = token.split_once('^') {
        return Some((symbol, exponent.parse().ok()?));
    }
    let digits = token
        .char_indices()
        .rev()
        .take_while(|(_, ch)| ch.is_ascii_digit() || *ch == '-')
        .last()
        .map(|(index, _)| index);
    match digits {
        Some(index) if index > 0 => Some((&token[..index], token[index..].parse().ok()?)),
        _ => Some((token, 1)),
    }
}

static LEADING_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([+-]?(?:\d+(?:\.\d*)?|\.\d+)(?:[eE][+-]?\d+)?)\s*(.*?)\s*$").unwrap()
});

fn parse_term(term: &str) -> Result<Quantity, QuoremError> {
    let captures = LEADING_NUMBER
        .captures(term)
        .ok_or_else(|| QuoremError::cast("quantity", term, "expected a leading number"))?;
    let magnitude: f64 = captures[1]
        .parse()
        .map_err(|_| QuoremError::cast("quantity", term, "invalid number"))?;
    let unit_text = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
    let unit = if unit_text.is_empty() {
        Unit::si(Dimension::NONE)
    } else {
        parse_unit(unit_text)?
    };
    Ok(Quantity { magnitude, unit })
}

/// Parses `<number> <unit>` or a compound duration such as
/// `2 minutes, 51 seconds, and 342787 microseconds`. A bare number is
/// dimensionless.
pub fn parse_quantity(text: &str) -> Result<Quantity, QuoremError> {
    let terms = text
        .split(',')
        .flat_map(|part| part.split(" and "))
        .map(|part| part.trim().trim_start_matches("and ").trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>();

    match terms.as_slice() {
        [] => Err(QuoremError::cast("quantity", text, "empty input")),
        [single] => parse_term(single),
        many => {
            let mut total = 0.0;
            let mut dimension = None;
            for term in many {
                let quantity = parse_term(term)?;
                if quantity.unit.offset != 0.0 {
                    return Err(QuoremError::cast("quantity", text, "offset units cannot be summed"));
                }
                match dimension {
                    None => dimension = Some(quantity.unit.dimension),
                    Some(existing) if existing != quantity.unit.dimension => {
                        return Err(QuoremError::cast("quantity", text, "mixed dimensions"));
                    }
                    Some(_) => {}
                }
                total += quantity.to_si();
            }
            Ok(Quantity {
                magnitude: total,
                unit: Unit::si(dimension.unwrap_or(Dimension::NONE)),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn close(left: f64, right: f64) -> bool {
        (left - right).abs() < 1e-9 * right.abs().max(1.0)
    }

    #[test]
    fn millilitres_normalize_to_litres() {
        let quantity = parse_quantity("25 mL").unwrap();
        let litres = QuantityKind::Volume.normalize(&quantity).unwrap();
        assert!(close(litres, 0.025));
    }

    #[test]
    fn celsius_and_kelvin() {
        let kelvin = parse_quantity("300 K").unwrap();
        let celsius = QuantityKind::Temperature.normalize(&kelvin).unwrap();
        assert!(close(celsius, 26.85));
    }

    #[test]
    fn compound_duration_is_summed() {
        let quantity = parse_quantity("2 minutes, 51 seconds, and 342787 microseconds").unwrap();
        let seconds = QuantityKind::Time.normalize(&quantity).unwrap();
        assert!(close(seconds, 171.342787));
    }

    #[test]
    fn velocity_expression() {
        let quantity = parse_quantity("36 km/h").unwrap();
        assert_eq!(QuantityKind::matching(quantity.unit.dimension), vec![QuantityKind::Velocity]);
        assert!(close(QuantityKind::Velocity.normalize(&quantity).unwrap(), 10.0));
    }

    #[test]
    fn concentration_prefixes() {
        let quantity = parse_quantity("5 mM").unwrap();
        assert!(close(QuantityKind::Concentration.normalize(&quantity).unwrap(), 0.005));
    }

    #[test]
    fn bare_number_is_dimensionless() {
        let quantity = parse_quantity("42").unwrap();
        assert!(QuantityKind::matching(quantity.unit.dimension).is_empty());
    }

    #[test]
    fn unknown_unit_is_rejected() {
        let err = parse_quantity("3 wombats").unwrap_err();
        assert_matches!(err, QuoremError::UnknownUnit(_));
    }

    #[test]
    fn unit_without_number_is_not_a_quantity() {
        assert!(parse_quantity("day").is_err());
    }
}
