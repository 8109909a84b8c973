use std::fmt;

use crate::errors::ValidationError;

/// Canonical instrument naming: `BASE/QUOTE[:PERP|:YYYYMMDD[-STRIKE-C|P]]`.
///
/// `BTC/USDT` spot, `BTC/USDT:PERP` perpetual, `BTC/USDT:20261225` dated
/// future, `BTC/USDT:20261225-60000-C` option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalSymbol {
    pub base: String,
    pub quote: String,
    pub kind: InstrumentKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrumentKind {
    Spot,
    Perp,
    Future { expiry: String },
    Option { expiry: String, strike: String, call: bool },
}

impl CanonicalSymbol {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let (pair, suffix) = match raw.split_once(':') {
            Some((pair, suffix)) => (pair, Some(suffix)),
            None => (raw, None),
        };

        let (base, quote) = pair
            .split_once('/')
            .ok_or_else(|| ValidationError::Decode(format!("symbol '{}' missing BASE/QUOTE", raw)))?;
        if base.is_empty() || quote.is_empty() {
            return Err(ValidationError::Decode(format!(
                "symbol '{}' has empty base or quote",
                raw
            )));
        }

        let kind = match suffix {
            None => InstrumentKind::Spot,
            Some("PERP") => InstrumentKind::Perp,
            Some(rest) => {
                let parts: Vec<&str> = rest.split('-').collect();
                match parts.as_slice() {
                    [expiry] if is_date(expiry) => InstrumentKind::Future {
                        expiry: expiry.to_string(),
                    },
                    [expiry, strike, cp] if is_date(expiry) && (*cp == "C" || *cp == "P") => {
                        InstrumentKind::Option {
                            expiry: expiry.to_string(),
                            strike: strike.to_string(),
                            call: *cp == "C",
                        }
                    }
                    _ => {
                        return Err(ValidationError::Decode(format!(
                            "symbol '{}' has unrecognized suffix '{}'",
                            raw, rest
                        )))
                    }
                }
            }
        };

        Ok(Self {
            base: base.to_string(),
            quote: quote.to_string(),
            kind,
        })
    }

    /// Venue-native flat rendering, e.g. `BTCUSDT` for the common CEX style.
    pub fn flat(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }
}

fn is_date(s: &str) -> bool {
    s.len() == 8 && s.chars().all(|c| c.is_ascii_digit())
}

impl fmt::Display for CanonicalSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)?;
        match &self.kind {
            InstrumentKind::Spot => Ok(()),
            InstrumentKind::Perp => write!(f, ":PERP"),
            InstrumentKind::Future { expiry } => write!(f, ":{}", expiry),
            InstrumentKind::Option { expiry, strike, call } => {
                write!(f, ":{}-{}-{}", expiry, strike, if *call { "C" } else { "P" })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_spot_perp_future_option() {
        let spot = CanonicalSymbol::parse("BTC/USDT").unwrap();
        assert_eq!(spot.kind, InstrumentKind::Spot);
        assert_eq!(spot.flat(), "BTCUSDT");

        let perp = CanonicalSymbol::parse("ETH/USDT:PERP").unwrap();
        assert_eq!(perp.kind, InstrumentKind::Perp);
        assert_eq!(perp.to_string(), "ETH/USDT:PERP");

        let fut = CanonicalSymbol::parse("BTC/USD:20261225").unwrap();
        assert!(matches!(fut.kind, InstrumentKind::Future { .. }));

        let opt = CanonicalSymbol::parse("BTC/USD:20261225-60000-C").unwrap();
        assert!(matches!(opt.kind, InstrumentKind::Option { call: true, .. }));
        assert_eq!(opt.to_string(), "BTC/USD:20261225-60000-C");
    }

    #[test]
    fn rejects_malformed() {
        assert!(CanonicalSymbol::parse("BTCUSDT").is_err());
        assert!(CanonicalSymbol::parse("BTC/").is_err());
        assert!(CanonicalSymbol::parse("BTC/USDT:SOON").is_err());
        assert!(CanonicalSymbol::parse("BTC/USDT:20261225-60000-X").is_err());
    }

    #[test]
    fn round_trips() {
        for raw in ["BTC/USDT", "ETH/USDT:PERP", "BTC/USD:20261225-60000-P"] {
            assert_eq!(CanonicalSymbol::parse(raw).unwrap().to_string(), raw);
        }
    }
}
