use std::fmt;
use std::str::FromStr;

use crate::bail;
use crate::error::{CascadeError, CascadeResult, ErrorKind};

/// Transaction visibility snapshot in the `xmin:xmax:xip1,xip2` text form.
///
/// A copy captures the snapshot its bulk read ran in. Events of transactions visible to that
/// snapshot are already contained in the copied data and must be skipped during catch-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxidSnapshot {
    pub xmin: i64,
    pub xmax: i64,
    pub xip: Vec<i64>,
}

impl TxidSnapshot {
    /// Returns `true` when `txid` had committed before the snapshot was taken.
    pub fn contains(&self, txid: i64) -> bool {
        if txid < self.xmin {
            return true;
        }
        if txid >= self.xmax {
            return false;
        }

        !self.xip.contains(&txid)
    }
}

impl FromStr for TxidSnapshot {
    type Err = CascadeError;

    fn from_str(s: &str) -> CascadeResult<Self> {
        let mut parts = s.trim().splitn(3, ':');
        let (Some(xmin), Some(xmax), Some(xip)) = (parts.next(), parts.next(), parts.next()) else {
            bail!(ErrorKind::InvalidSnapshot, "Snapshot must have three parts", s);
        };

        let parse = |value: &str| -> CascadeResult<i64> {
            value.parse::<i64>().map_err(|err| {
                crate::cascade_error!(
                    ErrorKind::InvalidSnapshot,
                    "Invalid txid in snapshot",
                    s,
                    source: err
                )
            })
        };

        let xmin = parse(xmin)?;
        let xmax = parse(xmax)?;
        let xip = xip
            .split(',')
            .filter(|txid| !txid.is_empty())
            .map(parse)
            .collect::<CascadeResult<Vec<_>>>()?;

        if xmin > xmax {
            bail!(ErrorKind::InvalidSnapshot, "Snapshot xmin is above xmax", s);
        }

        Ok(TxidSnapshot { xmin, xmax, xip })
    }
}

impl fmt::Display for TxidSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let xip = self
            .xip
            .iter()
            .map(|txid| txid.to_string())
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{}:{}:{}", self.xmin, self.xmax, xip)
    }
}
