use bytemuck::NoUninit;
use strum_macros::{Display, EnumString};

/// Granularity of native-memory recording. Ordered: once tracking has started
/// above [`TrackingLevel::Off`], the level only ever moves downward and can
/// never return to `Off`.
///
/// `Minimal` is an internal shutdown level; it is not accepted from the
/// environment.
#[repr(u8)]
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, NoUninit, EnumString, Display,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TrackingLevel {
    /// No tracking at all.
    Off,
    /// Tracking has been shut down; only residual state is kept.
    #[strum(disabled)]
    Minimal,
    /// Per-category reserved/committed totals.
    Summary,
    /// Summary plus a per-call-site table.
    Detail,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parse_external_values() {
        assert_eq!(TrackingLevel::from_str("off").unwrap(), TrackingLevel::Off);
        assert_eq!(
            TrackingLevel::from_str("summary").unwrap(),
            TrackingLevel::Summary
        );
        assert_eq!(
            TrackingLevel::from_str("Detail").unwrap(),
            TrackingLevel::Detail
        );
        // "minimal" is not an external setting.
        assert!(TrackingLevel::from_str("minimal").is_err());
        assert!(TrackingLevel::from_str("everything").is_err());
    }

    #[test]
    fn ordering() {
        assert!(TrackingLevel::Off < TrackingLevel::Minimal);
        assert!(TrackingLevel::Minimal < TrackingLevel::Summary);
        assert!(TrackingLevel::Summary < TrackingLevel::Detail);
    }
}
