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

//! How each temporal shape rewrites the processing-current records of a key.
//!
//! These functions work on a transaction's private copy of the current records, never on the
//! index. The commit later closes the superseded rows and installs whatever is left here.

use crate::record::{Payload, TemporalShape, TimeRange, Timestamp, VersionedRecord};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Refusal {
    Duplicate,
    NotFound,
}

fn sort(current: &mut [VersionedRecord]) {
    current.sort_by_key(|r| r.business.from);
}

/// Add a new current record starting at `record.business.from`.
pub(crate) fn insert(
    shape: TemporalShape,
    current: &mut Vec<VersionedRecord>,
    record: VersionedRecord,
) -> Result<(), Refusal> {
    let clash = if shape.tracks_business() {
        current.iter().any(|r| r.business.overlaps(&record.business))
    } else {
        !current.is_empty()
    };
    if clash {
        return Err(Refusal::Duplicate);
    }
    current.push(record);
    sort(current);
    Ok(())
}

/// Apply `change` to the payload from business date `from` until infinity, splitting the segment
/// that straddles `from`.
pub(crate) fn update_from(
    shape: TemporalShape,
    current: &mut Vec<VersionedRecord>,
    from: Timestamp,
    change: impl Fn(&mut Payload),
) -> Result<(), Refusal> {
    if !shape.tracks_business() {
        if current.is_empty() {
            return Err(Refusal::NotFound);
        }
        current.iter_mut().for_each(|r| change(&mut r.payload));
        return Ok(());
    }

    let mut touched = false;
    let mut out = Vec::with_capacity(current.len() + 1);
    for mut seg in current.drain(..) {
        if seg.business.to <= from && !seg.business.to.is_infinity() {
            out.push(seg);
        } else if seg.business.from < from {
            let mut tail = seg.clone();
            seg.business = TimeRange::new(seg.business.from, from);
            tail.business = TimeRange::new(from, tail.business.to);
            change(&mut tail.payload);
            out.push(seg);
            out.push(tail);
            touched = true;
        } else {
            change(&mut seg.payload);
            out.push(seg);
            touched = true;
        }
    }
    *current = out;
    sort(current);
    if touched { Ok(()) } else { Err(Refusal::NotFound) }
}

/// End the business life of the key at `at`. Shapes without a business axis lose the row.
pub(crate) fn terminate_at(
    shape: TemporalShape,
    current: &mut Vec<VersionedRecord>,
    at: Timestamp,
) -> Result<(), Refusal> {
    if !shape.tracks_business() {
        return clear(current);
    }
    if !current.iter().any(|r| r.business.to > at) {
        return Err(Refusal::NotFound);
    }
    current.retain(|r| r.business.from < at);
    for r in current.iter_mut() {
        if r.business.to > at {
            r.business = TimeRange::new(r.business.from, at);
        }
    }
    Ok(())
}

/// Remove every current record.
pub(crate) fn clear(current: &mut Vec<VersionedRecord>) -> Result<(), Refusal> {
    if current.is_empty() {
        return Err(Refusal::NotFound);
    }
    current.clear();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{PrimaryKey, Value, VersionToken};

    fn ts(ms: i64) -> Timestamp {
        Timestamp(ms)
    }

    fn seg(business: TimeRange, qty: i64) -> VersionedRecord {
        VersionedRecord::new(
            PrimaryKey::from(1),
            business,
            TimeRange::open(ts(0)),
            Payload::new().with("qty", qty),
            VersionToken::Counter(1),
        )
    }

    fn qty(r: &VersionedRecord) -> Option<&Value> {
        r.payload.get("qty")
    }

    #[test]
    fn test_bitemporal_update_splits_segment() {
        let mut current = vec![seg(TimeRange::open(ts(100)), 5)];
        update_from(TemporalShape::Bitemporal, &mut current, ts(200), |p| {
            p.set("qty", 7)
        })
        .unwrap();
        assert_eq!(current.len(), 2);
        assert_eq!(current[0].business, TimeRange::new(ts(100), ts(200)));
        assert_eq!(qty(&current[0]), Some(&Value::Int(5)));
        assert_eq!(current[1].business, TimeRange::open(ts(200)));
        assert_eq!(qty(&current[1]), Some(&Value::Int(7)));
    }

    #[test]
    fn test_update_from_segment_start_does_not_split() {
        let mut current = vec![seg(TimeRange::open(ts(100)), 5)];
        update_from(TemporalShape::Bitemporal, &mut current, ts(100), |p| {
            p.set("qty", 6)
        })
        .unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(qty(&current[0]), Some(&Value::Int(6)));
    }

    #[test]
    fn test_update_after_terminated_life_is_not_found() {
        let mut current = vec![seg(TimeRange::new(ts(0), ts(50)), 5)];
        assert_eq!(
            update_from(TemporalShape::Bitemporal, &mut current, ts(60), |_| {}),
            Err(Refusal::NotFound)
        );
        assert_eq!(current.len(), 1);
    }

    #[test]
    fn test_terminate_truncates_and_drops_later_segments() {
        let mut current = vec![
            seg(TimeRange::new(ts(0), ts(50)), 1),
            seg(TimeRange::open(ts(50)), 2),
        ];
        terminate_at(TemporalShape::Bitemporal, &mut current, ts(30)).unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].business, TimeRange::new(ts(0), ts(30)));
        assert_eq!(
            terminate_at(TemporalShape::Bitemporal, &mut current, ts(40)),
            Err(Refusal::NotFound)
        );
    }

    #[test]
    fn test_insert_duplicate_and_after_termination() {
        let mut current = vec![seg(TimeRange::new(ts(0), ts(50)), 1)];
        assert_eq!(
            insert(
                TemporalShape::Bitemporal,
                &mut current,
                seg(TimeRange::open(ts(10)), 2)
            ),
            Err(Refusal::Duplicate)
        );
        // A new life after the termination date is allowed.
        insert(
            TemporalShape::Bitemporal,
            &mut current,
            seg(TimeRange::open(ts(50)), 3),
        )
        .unwrap();
        assert_eq!(current.len(), 2);

        let mut nondated = vec![seg(TimeRange::all(), 1)];
        assert_eq!(
            insert(
                TemporalShape::NonDated,
                &mut nondated,
                seg(TimeRange::all(), 2)
            ),
            Err(Refusal::Duplicate)
        );
        terminate_at(TemporalShape::NonDated, &mut nondated, ts(0)).unwrap();
        assert!(nondated.is_empty());
    }
}
