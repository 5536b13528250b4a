//! Error reports and engine faults
//!
//! Violations detected while interpreting a program are *reports*: they are
//! recorded and the analysis keeps going, so one run surfaces as many
//! defects as possible. Engine faults are different: an internal invariant
//! was broken, the current function's analysis is aborted, and the reports
//! gathered so far remain usable.

use crate::trace::TraceId;
use shale_ir::Loc;

/// Kind of a memory-safety violation surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Read/write through null, a deleted-origin unknown, or an
    /// invalidated object's address.
    InvalidDeref,
    /// `free` of a non-heap address or of an interior pointer.
    InvalidFree,
    /// A valid heap object left unreachable at function exit.
    MemLeak,
    /// Read/write through an address into an invalidated object.
    UseAfterFree,
    /// `free` of an already invalidated object.
    DoubleFree,
    /// Read of a value whose origin is an uninitialized cell.
    UninitRead,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ErrorKind::InvalidDeref => "invalid dereference",
            ErrorKind::InvalidFree => "invalid free",
            ErrorKind::MemLeak => "memory leak",
            ErrorKind::UseAfterFree => "use after free",
            ErrorKind::DoubleFree => "double free",
            ErrorKind::UninitRead => "read of uninitialized value",
        };
        f.write_str(text)
    }
}

/// One recorded violation: what, where, and the trace node of the heap it
/// was observed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub kind: ErrorKind,
    pub loc: Loc,
    pub trace: TraceId,
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.loc, self.kind)
    }
}

/// Sink receiving reports as the analysis produces them.
pub trait ReportSink {
    fn report(&mut self, report: Report);
}

/// The default sink: collects reports into a vector.
#[derive(Debug, Default)]
pub struct CollectedReports {
    reports: Vec<Report>,
}

impl CollectedReports {
    pub fn new() -> Self {
        CollectedReports::default()
    }

    pub fn as_slice(&self) -> &[Report] {
        &self.reports
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn count_of(&self, kind: ErrorKind) -> usize {
        self.reports.iter().filter(|r| r.kind == kind).count()
    }
}

impl ReportSink for CollectedReports {
    fn report(&mut self, report: Report) {
        self.reports.push(report);
    }
}

/// Internal failure of the engine itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// An invariant violation detected mid-interpretation; carries the
    /// location of the instruction being interpreted.
    Fault { msg: String, loc: Loc },
    /// A depth or step budget was exhausted; partial results remain valid.
    BudgetExceeded { what: &'static str },
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Fault { msg, loc } => write!(f, "engine fault at {}: {}", loc, msg),
            EngineError::BudgetExceeded { what } => {
                write!(f, "analysis incomplete: {} budget exceeded", what)
            }
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collected_reports_count_by_kind() {
        let mut sink = CollectedReports::new();
        sink.report(Report {
            kind: ErrorKind::DoubleFree,
            loc: Loc::line(4),
            trace: TraceId(0),
        });
        sink.report(Report {
            kind: ErrorKind::MemLeak,
            loc: Loc::line(9),
            trace: TraceId(1),
        });
        sink.report(Report {
            kind: ErrorKind::DoubleFree,
            loc: Loc::line(12),
            trace: TraceId(2),
        });

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.count_of(ErrorKind::DoubleFree), 2);
        assert_eq!(sink.count_of(ErrorKind::UseAfterFree), 0);
    }

    #[test]
    fn engine_error_displays_location() {
        let err = EngineError::Fault {
            msg: "field written into an unmaterialized object".into(),
            loc: Loc::line(7),
        };
        assert_eq!(
            err.to_string(),
            "engine fault at line 7: field written into an unmaterialized object"
        );
    }
}
