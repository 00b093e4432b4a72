use crate::core::io::control::ControlRecord;
use crate::core::io::output::OutputRecord;
use crate::core::io::restart::RestartRecord;
use crate::core::io::topology::TopologyRecord;
use crate::core::io::trajectory::TrajectoryRecord;

/// Capability queries shared by the five record kinds.
///
/// The records overlap only partially (atom counts, box geometry, timing),
/// so consistency checks ask each record what it can report instead of
/// assuming a common layout. Every method defaults to "not reported".
pub trait Capabilities {
    fn atom_count(&self) -> Option<u64> {
        None
    }

    fn box_dimensions(&self) -> Option<[f64; 3]> {
        None
    }

    /// First and last simulated time covered by this record, in ps.
    fn time_span(&self) -> Option<(f64, f64)> {
        None
    }
}

impl Capabilities for TopologyRecord {
    fn atom_count(&self) -> Option<u64> {
        self.atom_count
    }

    fn box_dimensions(&self) -> Option<[f64; 3]> {
        self.box_dimensions
    }
}

impl Capabilities for ControlRecord {}

impl Capabilities for OutputRecord {
    fn atom_count(&self) -> Option<u64> {
        self.atom_count
    }

    fn time_span(&self) -> Option<(f64, f64)> {
        match (self.statistics.time_first, self.statistics.time_last) {
            (Some(first), Some(last)) => Some((first, last)),
            _ => None,
        }
    }
}

impl Capabilities for TrajectoryRecord {
    fn atom_count(&self) -> Option<u64> {
        self.atom_count
    }

    fn time_span(&self) -> Option<(f64, f64)> {
        match (self.time_start, self.time_end) {
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        }
    }
}

impl Capabilities for RestartRecord {
    fn atom_count(&self) -> Option<u64> {
        self.atom_count
    }

    fn box_dimensions(&self) -> Option<[f64; 3]> {
        self.box_dimensions
    }

    fn time_span(&self) -> Option<(f64, f64)> {
        self.time_ps.map(|t| (t, t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_records_report_no_capabilities() {
        let record = ControlRecord::default();
        assert_eq!(record.atom_count(), None);
        assert_eq!(record.box_dimensions(), None);
        assert_eq!(record.time_span(), None);
    }

    #[test]
    fn restart_time_span_is_a_point() {
        let record = RestartRecord {
            time_ps: Some(500.0),
            ..RestartRecord::default()
        };
        assert_eq!(record.time_span(), Some((500.0, 500.0)));
    }

    #[test]
    fn trajectory_time_span_requires_both_ends() {
        let record = TrajectoryRecord {
            time_start: Some(0.0),
            ..TrajectoryRecord::default()
        };
        assert_eq!(record.time_span(), None);
    }
}
