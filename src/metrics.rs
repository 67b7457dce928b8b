//! Server counters in Prometheus exposition format. The framework only
//! counts; embedders decide how (or whether) to serve the text.

use crate::proto::OpKind;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    /// Accepted client connections.
    pub connections_total: AtomicU64,
    /// Dispatched requests by operation.
    pub requests_bind: AtomicU64,
    pub requests_search: AtomicU64,
    pub requests_add: AtomicU64,
    pub requests_modify: AtomicU64,
    pub requests_modify_dn: AtomicU64,
    pub requests_delete: AtomicU64,
    pub requests_compare: AtomicU64,
    pub requests_extended: AtomicU64,
    /// Inbound messages that failed to parse (skipped or fatal).
    pub parse_errors_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_connections(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_parse_error(&self) {
        self.parse_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_request(&self, op: &str) {
        let counter = match op {
            "bind" => &self.requests_bind,
            "search" => &self.requests_search,
            "add" => &self.requests_add,
            "modify" => &self.requests_modify,
            "modify_dn" => &self.requests_modify_dn,
            "delete" => &self.requests_delete,
            "compare" => &self.requests_compare,
            "extended" => &self.requests_extended,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render all counters in Prometheus text format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# HELP ldapserver_connections_total Accepted client connections.");
        let _ = writeln!(out, "# TYPE ldapserver_connections_total counter");
        let _ = writeln!(
            out,
            "ldapserver_connections_total {}",
            self.connections_total.load(Ordering::Relaxed)
        );
        let _ = writeln!(out, "# HELP ldapserver_requests_total Dispatched requests by operation.");
        let _ = writeln!(out, "# TYPE ldapserver_requests_total counter");
        for (op, counter) in [
            ("bind", &self.requests_bind),
            ("search", &self.requests_search),
            ("add", &self.requests_add),
            ("modify", &self.requests_modify),
            ("modify_dn", &self.requests_modify_dn),
            ("delete", &self.requests_delete),
            ("compare", &self.requests_compare),
            ("extended", &self.requests_extended),
        ] {
            let _ = writeln!(
                out,
                "ldapserver_requests_total{{op=\"{}\"}} {}",
                op,
                counter.load(Ordering::Relaxed)
            );
        }
        let _ = writeln!(out, "# HELP ldapserver_parse_errors_total Unparseable inbound messages.");
        let _ = writeln!(out, "# TYPE ldapserver_parse_errors_total counter");
        let _ = writeln!(
            out,
            "ldapserver_parse_errors_total {}",
            self.parse_errors_total.load(Ordering::Relaxed)
        );
        out
    }
}

/// Metric label for an operation kind. Unbind and Abandon produce no
/// response and are not counted.
pub(crate) fn metric_op_name(kind: OpKind) -> Option<&'static str> {
    match kind {
        OpKind::Bind => Some("bind"),
        OpKind::Search => Some("search"),
        OpKind::Add => Some("add"),
        OpKind::Modify => Some("modify"),
        OpKind::ModifyDn => Some("modify_dn"),
        OpKind::Delete => Some("delete"),
        OpKind::Compare => Some("compare"),
        OpKind::Extended => Some("extended"),
        OpKind::Unbind | OpKind::Abandon => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_render() {
        let m = Metrics::new();
        m.inc_connections();
        m.inc_request("bind");
        m.inc_request("search");
        m.inc_request("search");
        m.inc_request("unknown-op");
        m.inc_parse_error();
        let text = m.render();
        assert!(text.contains("ldapserver_connections_total 1"));
        assert!(text.contains("ldapserver_requests_total{op=\"bind\"} 1"));
        assert!(text.contains("ldapserver_requests_total{op=\"search\"} 2"));
        assert!(text.contains("ldapserver_parse_errors_total 1"));
    }

    #[test]
    fn op_names() {
        assert_eq!(metric_op_name(OpKind::Bind), Some("bind"));
        assert_eq!(metric_op_name(OpKind::Unbind), None);
        assert_eq!(metric_op_name(OpKind::Abandon), None);
    }
}
