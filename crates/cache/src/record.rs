// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The bitemporal record model: timestamps, half-open ranges, primary keys, payloads and version
//! tokens.

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Milliseconds since the Unix epoch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Open lower bound, used as the start of axes an entity does not track.
    pub const MIN: Timestamp = Timestamp(i64::MIN);
    /// The "still current" sentinel.
    pub const INFINITY: Timestamp = Timestamp(i64::MAX);

    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    /// Midnight UTC of the given calendar date.
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        let date = NaiveDate::from_ymd_opt(year, month, day)?;
        let midnight = date.and_hms_opt(0, 0, 0)?;
        Some(Self(midnight.and_utc().timestamp_millis()))
    }

    pub fn is_infinity(&self) -> bool {
        *self == Self::INFINITY
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::INFINITY => write!(f, "∞"),
            Self::MIN => write!(f, "-∞"),
            Timestamp(ms) => match chrono::DateTime::<Utc>::from_timestamp_millis(ms) {
                Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.3fZ")),
                None => write!(f, "{ms}ms"),
            },
        }
    }
}

/// Half-open interval `[from, to)`.
///
/// A range ending at `INFINITY` also contains the `INFINITY` point itself, so that "as of
/// infinity" lookups find the open (current) record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: Timestamp,
    pub to: Timestamp,
}

impl TimeRange {
    pub fn new(from: Timestamp, to: Timestamp) -> Self {
        Self { from, to }
    }

    /// `[from, ∞)`
    pub fn open(from: Timestamp) -> Self {
        Self {
            from,
            to: Timestamp::INFINITY,
        }
    }

    /// The whole axis, for dimensions an entity does not track.
    pub fn all() -> Self {
        Self::open(Timestamp::MIN)
    }

    pub fn contains(&self, t: Timestamp) -> bool {
        if t.is_infinity() {
            return self.to.is_infinity();
        }
        self.from <= t && t < self.to
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.from < other.to && other.from < self.to
    }

    pub fn is_open(&self) -> bool {
        self.to.is_infinity()
    }

    pub fn is_empty(&self) -> bool {
        self.from >= self.to
    }

    /// A copy of this range with `to` set to `at`.
    pub fn closed_at(&self, at: Timestamp) -> Self {
        Self {
            from: self.from,
            to: at,
        }
    }
}

impl Display for TimeRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

/// One scalar component of a primary key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyPart {
    Int(i64),
    Str(Arc<str>),
    Bool(bool),
    Timestamp(Timestamp),
}

impl Display for KeyPart {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyPart::Int(i) => write!(f, "{i}"),
            KeyPart::Str(s) => write!(f, "{s:?}"),
            KeyPart::Bool(b) => write!(f, "{b}"),
            KeyPart::Timestamp(t) => write!(f, "{t}"),
        }
    }
}

/// Ordered tuple of key parts. Totally ordered so it can be range-partitioned.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PrimaryKey(SmallVec<[KeyPart; 2]>);

impl PrimaryKey {
    pub fn new(parts: impl IntoIterator<Item = KeyPart>) -> Self {
        Self(parts.into_iter().collect())
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }
}

impl From<i64> for PrimaryKey {
    fn from(value: i64) -> Self {
        Self::new([KeyPart::Int(value)])
    }
}

impl From<i32> for PrimaryKey {
    fn from(value: i32) -> Self {
        Self::new([KeyPart::Int(i64::from(value))])
    }
}

impl From<&str> for PrimaryKey {
    fn from(value: &str) -> Self {
        Self::new([KeyPart::Str(Arc::from(value))])
    }
}

impl Display for PrimaryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{part}")?;
        }
        write!(f, ")")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Bool(bool),
    Timestamp(Timestamp),
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(Arc::from(value))
    }
}

impl From<Timestamp> for Value {
    fn from(value: Timestamp) -> Self {
        Value::Timestamp(value)
    }
}

/// Attribute name → value. The engine never interprets it beyond the optional source attribute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload(BTreeMap<Arc<str>, Value>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.0.insert(Arc::from(name), value.into());
    }

    /// Overlay every attribute of `other` onto this payload.
    pub fn merge(&mut self, other: &Payload) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// How an entity type stamps optimistic versions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
pub enum VersioningStrategy {
    #[default]
    Counter,
    LastModified,
}

/// The token compared at commit to detect concurrent modification.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VersionToken {
    Counter(u64),
    LastModified(Timestamp),
}

impl VersionToken {
    pub fn initial(strategy: VersioningStrategy, at: Timestamp) -> Self {
        match strategy {
            VersioningStrategy::Counter => VersionToken::Counter(1),
            VersioningStrategy::LastModified => VersionToken::LastModified(at),
        }
    }

    /// The successor of this token. Last-modified tokens always move forward even if the clock
    /// does not.
    pub fn next(&self, at: Timestamp) -> Self {
        match *self {
            VersionToken::Counter(n) => VersionToken::Counter(n + 1),
            VersionToken::LastModified(prev) => {
                VersionToken::LastModified(Timestamp(at.0.max(prev.0.saturating_add(1))))
            }
        }
    }
}

impl Display for VersionToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionToken::Counter(n) => write!(f, "v{n}"),
            VersionToken::LastModified(t) => write!(f, "@{t}"),
        }
    }
}

/// Which temporal dimension a uni-dated entity tracks.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum Axis {
    Business,
    /// Audit-only: the system (processing) axis.
    Processing,
}

/// The temporal shape of an entity type. Fixed at registration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TemporalShape {
    NonDated,
    UniDated(Axis),
    Bitemporal,
}

impl TemporalShape {
    pub fn tracks_business(&self) -> bool {
        matches!(
            self,
            TemporalShape::Bitemporal | TemporalShape::UniDated(Axis::Business)
        )
    }

    pub fn tracks_processing(&self) -> bool {
        matches!(
            self,
            TemporalShape::Bitemporal | TemporalShape::UniDated(Axis::Processing)
        )
    }

    /// Replace coordinates on untracked axes with infinity, which every record on such an axis
    /// contains.
    pub fn normalize(&self, as_of: AsOf) -> AsOf {
        AsOf {
            business: if self.tracks_business() {
                as_of.business
            } else {
                Timestamp::INFINITY
            },
            system: if self.tracks_processing() {
                as_of.system
            } else {
                Timestamp::INFINITY
            },
        }
    }
}

/// A point on both temporal axes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AsOf {
    pub business: Timestamp,
    pub system: Timestamp,
}

impl AsOf {
    /// Latest business state as currently known.
    pub fn current() -> Self {
        Self {
            business: Timestamp::INFINITY,
            system: Timestamp::INFINITY,
        }
    }

    /// Business date `business`, as currently known.
    pub fn at(business: Timestamp) -> Self {
        Self {
            business,
            system: Timestamp::INFINITY,
        }
    }

    pub fn bitemporal(business: Timestamp, system: Timestamp) -> Self {
        Self { business, system }
    }
}

/// A single immutable bitemporal snapshot of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub primary_key: PrimaryKey,
    pub business: TimeRange,
    pub system: TimeRange,
    pub payload: Payload,
    pub version: VersionToken,
}

impl VersionedRecord {
    pub fn new(
        primary_key: PrimaryKey,
        business: TimeRange,
        system: TimeRange,
        payload: Payload,
        version: VersionToken,
    ) -> Self {
        Self {
            primary_key,
            business,
            system,
            payload,
            version,
        }
    }

    /// Whether the record's rectangle contains the given point.
    pub fn contains(&self, as_of: AsOf) -> bool {
        self.business.contains(as_of.business) && self.system.contains(as_of.system)
    }

    /// True while the record has not been superseded on the processing axis.
    pub fn is_processing_current(&self) -> bool {
        self.system.is_open()
    }

    /// The (business.from, system.from) slot that identifies this record within its key.
    pub fn slot(&self) -> (Timestamp, Timestamp) {
        (self.business.from, self.system.from)
    }

    /// Two records of the same key conflict when their rectangles intersect.
    pub fn overlaps(&self, other: &VersionedRecord) -> bool {
        self.business.overlaps(&other.business) && self.system.overlaps(&other.system)
    }

    pub fn with_system_closed(&self, at: Timestamp) -> Self {
        Self {
            system: self.system.closed_at(at),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn ts(ms: i64) -> Timestamp {
        Timestamp(ms)
    }

    #[test_case(ts(10), true; "lower bound inclusive")]
    #[test_case(ts(20), false; "upper bound exclusive")]
    #[test_case(ts(9), false; "before")]
    #[test_case(Timestamp::INFINITY, false; "infinity on closed range")]
    fn test_closed_range_contains(t: Timestamp, expected: bool) {
        assert_eq!(TimeRange::new(ts(10), ts(20)).contains(t), expected);
    }

    #[test]
    fn test_open_range_contains_infinity() {
        let r = TimeRange::open(ts(10));
        assert!(r.contains(Timestamp::INFINITY));
        assert!(r.contains(ts(1_000_000)));
        assert!(!r.contains(ts(5)));
        assert!(r.is_open());
        assert!(!r.closed_at(ts(50)).is_open());
    }

    #[test]
    fn test_overlaps() {
        let a = TimeRange::new(ts(0), ts(10));
        let b = TimeRange::new(ts(10), ts(20));
        let c = TimeRange::open(ts(5));
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
    }

    #[test]
    fn test_version_tokens_advance() {
        let v = VersionToken::initial(VersioningStrategy::Counter, ts(0));
        assert_eq!(v, VersionToken::Counter(1));
        assert_eq!(v.next(ts(0)), VersionToken::Counter(2));

        let lm = VersionToken::initial(VersioningStrategy::LastModified, ts(100));
        // A clock that has not moved still yields a strictly newer token.
        assert_eq!(lm.next(ts(100)), VersionToken::LastModified(ts(101)));
        assert_eq!(lm.next(ts(500)), VersionToken::LastModified(ts(500)));
    }

    #[test]
    fn test_primary_key_ordering() {
        let a = PrimaryKey::from(1);
        let b = PrimaryKey::from(2);
        let ab = PrimaryKey::new([KeyPart::Int(1), KeyPart::Str("x".into())]);
        assert!(a < b);
        assert!(a < ab);
        assert!(ab < b);
        assert_eq!(ab.to_string(), "(1, \"x\")");
    }

    #[test]
    fn test_normalize_untracked_axes() {
        let point = AsOf::bitemporal(ts(5), ts(7));
        assert_eq!(TemporalShape::NonDated.normalize(point), AsOf::current());
        assert_eq!(
            TemporalShape::UniDated(Axis::Business).normalize(point),
            AsOf::at(ts(5))
        );
        assert_eq!(
            TemporalShape::UniDated(Axis::Processing).normalize(point),
            AsOf::bitemporal(Timestamp::INFINITY, ts(7))
        );
        assert_eq!(TemporalShape::Bitemporal.normalize(point), point);
    }

    #[test]
    fn test_from_ymd() {
        let t = Timestamp::from_ymd(2020, 1, 1).unwrap();
        assert_eq!(t, Timestamp(1_577_836_800_000));
        assert!(Timestamp::from_ymd(2020, 2, 30).is_none());
    }
}
