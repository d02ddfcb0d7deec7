//! Network parameters that steer how relays are measured.
//!
//! The consensus carries a `params` line of integer-valued items voted
//! on by the directory authorities.  A bandwidth scanner only cares
//! about two of them: `cc_alg`, which tells whether congestion control
//! is deployed on the network, and `bwscanner_cc`, which tells the
//! scanner whether it should measure relays through congestion-control
//! capable exits, and whether it should measure them by uploading
//! instead of downloading.
//!
//! Like every consensus parameter, both are clamped to their allowed
//! range, and default to 0 when absent.

use crate::ParamError;

/// Value of `cc_alg` when congestion control (Vegas) is enabled.
const CC_ALG_VEGAS: i32 = 2;

/// How a relay's throughput should be probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProbeVariant {
    /// Download byte ranges from a destination.
    Download,
    /// Upload data to a destination and read the circuit's bandwidth.
    Upload,
}

/// An integer parameter with a default and an inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BoundedParam {
    /// Current value; always within `[min, max]`.
    value: i32,
    /// Smallest allowed value.
    min: i32,
    /// Largest allowed value.
    max: i32,
}

impl BoundedParam {
    /// Make a new parameter with value `dflt`.
    const fn new(dflt: i32, min: i32, max: i32) -> Self {
        BoundedParam {
            value: dflt,
            min,
            max,
        }
    }

    /// Parse `s` and set this parameter to it, clamped to the bounds.
    fn saturating_set(&mut self, s: &str) -> Result<(), ()> {
        let v: i64 = s.trim().parse().map_err(|_| ())?;
        let v = v.clamp(i64::from(self.min), i64::from(self.max));
        // in range of i32 because of the clamp above
        self.value = v as i32;
        Ok(())
    }
}

/// The recognized network parameters, with values in range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetParameters {
    /// Which congestion control algorithm the network uses.
    cc_alg: BoundedParam,
    /// How the bandwidth scanner should treat congestion control.
    bwscanner_cc: BoundedParam,
}

impl Default for NetParameters {
    fn default() -> Self {
        NetParameters {
            cc_alg: BoundedParam::new(0, 0, 2),
            bwscanner_cc: BoundedParam::new(0, 0, 2),
        }
    }
}

impl NetParameters {
    /// Return the parameters that a testing network always uses:
    /// congestion control on, and congestion-control exits preferred.
    pub fn testing_network() -> Self {
        let mut p = NetParameters::default();
        p.cc_alg.value = CC_ALG_VEGAS;
        p.bwscanner_cc.value = 2;
        p
    }

    /// Set a single parameter from its name and value.
    fn saturating_update_override(&mut self, name: &str, value: &str) -> Result<(), ParamError> {
        let param = match name {
            "cc_alg" => &mut self.cc_alg,
            "bwscanner_cc" => &mut self.bwscanner_cc,
            _ => return Err(ParamError::KeyNotRecognized(name.to_string())),
        };
        param
            .saturating_set(value)
            .map_err(|_| ParamError::InvalidValue(name.to_string(), value.to_string()))
    }

    /// Update these parameters from an iterator of name/value pairs.
    ///
    /// Every recognized parameter is set; the problems with the other
    /// ones are returned together.
    pub fn saturating_update<'a>(
        &mut self,
        iter: impl Iterator<Item = (&'a str, &'a str)>,
    ) -> Result<(), Vec<ParamError>> {
        let errors: Vec<_> = iter
            .filter_map(|(k, v)| self.saturating_update_override(k, v).err())
            .filter(|e| !matches!(e, ParamError::KeyNotRecognized(_)))
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Return the raw `cc_alg` value.
    pub fn cc_alg(&self) -> i32 {
        self.cc_alg.value
    }

    /// Return the raw `bwscanner_cc` value.
    pub fn bwscanner_cc(&self) -> i32 {
        self.bwscanner_cc.value
    }

    /// Return true if congestion control is enabled on the network.
    pub fn congestion_control_enabled(&self) -> bool {
        self.cc_alg.value == CC_ALG_VEGAS
    }

    /// Return true if the scanner should prefer exits that support
    /// congestion control (`FlowCtrl=2`).
    pub fn prefer_cc_exits(&self) -> bool {
        self.bwscanner_cc.value >= 1
    }

    /// Return which probing method relays should be measured with.
    pub fn probe_variant(&self) -> ProbeVariant {
        if self.bwscanner_cc.value == 2 {
            ProbeVariant::Upload
        } else {
            ProbeVariant::Download
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn defaults() {
        let p = NetParameters::default();
        assert_eq!(p.cc_alg(), 0);
        assert_eq!(p.bwscanner_cc(), 0);
        assert!(!p.congestion_control_enabled());
        assert!(!p.prefer_cc_exits());
        assert_eq!(p.probe_variant(), ProbeVariant::Download);
    }

    #[test]
    fn update() {
        let mut p = NetParameters::default();
        let pairs = vec![("cc_alg", "2"), ("bwscanner_cc", "1"), ("circwindow", "80")];
        p.saturating_update(pairs.into_iter()).unwrap();
        assert!(p.congestion_control_enabled());
        assert!(p.prefer_cc_exits());
        assert_eq!(p.probe_variant(), ProbeVariant::Download);
    }

    #[test]
    fn clamped() {
        let mut p = NetParameters::default();
        let pairs = vec![("cc_alg", "-5"), ("bwscanner_cc", "99")];
        p.saturating_update(pairs.into_iter()).unwrap();
        assert_eq!(p.cc_alg(), 0);
        assert_eq!(p.bwscanner_cc(), 2);
        assert_eq!(p.probe_variant(), ProbeVariant::Upload);
    }

    #[test]
    fn invalid_value() {
        let mut p = NetParameters::default();
        let pairs = vec![("cc_alg", "two"), ("bwscanner_cc", "1")];
        let errs = p.saturating_update(pairs.into_iter()).unwrap_err();
        assert_eq!(
            errs,
            vec![ParamError::InvalidValue("cc_alg".into(), "two".into())]
        );
        // The good one was still applied.
        assert_eq!(p.bwscanner_cc(), 1);
        assert_eq!(p.cc_alg(), 0);
    }

    #[test]
    fn testing() {
        let p = NetParameters::testing_network();
        assert!(p.congestion_control_enabled());
        assert!(p.prefer_cc_exits());
        assert_eq!(p.probe_variant(), ProbeVariant::Upload);
    }
}
