//! Resumption-Token Codec
//!
//! A resumption token is the externally addressable form of a selection
//! cursor: metadata prefix, continue-after stamp, from/until range, set and
//! optional partition, packed into a short opaque string. The codec is
//! stateless and total: `decode(encode(t)) == t`, and any string that does
//! not carry exactly the expected field set fails with
//! `BadResumptionToken` so the protocol layer can answer
//! `badResumptionToken` instead of crashing.
//!
//! Wire form: pipe-joined parts, each a one-character key followed by the
//! value, e.g. `moai_dc|c1455|f|u|sabc|p1,2/4` (field order is fixed on
//! encode, free on decode).

use std::str::FromStr;

use crate::error::OaiError;
use crate::partition::Partition;
use crate::stamp::Stamp;

const KEY_PREFIX: char = 'm';
const KEY_CONTINUE_AFTER: char = 'c';
const KEY_FROM: char = 'f';
const KEY_UNTIL: char = 'u';
const KEY_SET: char = 's';
const KEY_PARTITION: char = 'p';

/// Serialized cursor state for stateless pagination.
///
/// Empty strings mean "not given"; `continue_after` 0 means "from the
/// beginning". Tokens embed the literal stamp and are therefore only
/// meaningful against the store that issued them; replaying a foreign
/// token repositions silently.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResumptionToken {
    pub metadata_prefix: String,
    pub continue_after: Stamp,
    pub from: String,
    pub until: String,
    pub set_spec: String,
    pub partition: Option<Partition>,
}

impl ResumptionToken {
    pub fn encode(&self) -> String {
        let mut encoded = format!(
            "{}{}|{}{}|{}{}|{}{}|{}{}",
            KEY_PREFIX,
            self.metadata_prefix,
            KEY_CONTINUE_AFTER,
            self.continue_after,
            KEY_FROM,
            self.from,
            KEY_UNTIL,
            self.until,
            KEY_SET,
            self.set_spec,
        );
        if let Some(partition) = &self.partition {
            encoded.push('|');
            encoded.push(KEY_PARTITION);
            encoded.push_str(&partition.to_string());
        }
        encoded
    }

    pub fn decode(token: &str) -> Result<Self, OaiError> {
        let bad = || OaiError::BadResumptionToken(token.to_string());

        let mut metadata_prefix = None;
        let mut continue_after = None;
        let mut from = None;
        let mut until = None;
        let mut set_spec = None;
        let mut partition = None;

        for part in token.split('|') {
            let mut chars = part.chars();
            let key = chars.next().ok_or_else(bad)?;
            let value = chars.as_str();
            let slot = match key {
                KEY_PREFIX => &mut metadata_prefix,
                KEY_CONTINUE_AFTER => &mut continue_after,
                KEY_FROM => &mut from,
                KEY_UNTIL => &mut until,
                KEY_SET => &mut set_spec,
                KEY_PARTITION => &mut partition,
                _ => return Err(bad()),
            };
            if slot.replace(value).is_some() {
                return Err(bad()); // duplicate field
            }
        }

        Ok(ResumptionToken {
            metadata_prefix: metadata_prefix.ok_or_else(bad)?.to_string(),
            continue_after: continue_after
                .ok_or_else(bad)?
                .parse::<Stamp>()
                .map_err(|_| bad())?,
            from: from.ok_or_else(bad)?.to_string(),
            until: until.ok_or_else(bad)?.to_string(),
            set_spec: set_spec.ok_or_else(bad)?.to_string(),
            partition: match partition {
                None => None,
                Some(spec) => Some(Partition::from_str(spec).map_err(|_| bad())?),
            },
        })
    }
}

impl std::fmt::Display for ResumptionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl FromStr for ResumptionToken {
    type Err = OaiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResumptionToken::decode(s)
    }
}
