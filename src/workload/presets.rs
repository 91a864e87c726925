use crate::domain::DatabaseKind;

const SQL_PRESETS: [&str; 4] = [
    "oltp_read_write",
    "oltp_read_only",
    "oltp_write_only",
    "oltp_point_select",
];

/// Built-in workloads the engine ships for `kind`; `None` when the kind has
/// no presets at all.
pub(super) fn presets_for(kind: &DatabaseKind) -> Option<&'static [&'static str]> {
    match kind {
        DatabaseKind::MySql | DatabaseKind::PostgreSql => Some(&SQL_PRESETS),
        DatabaseKind::Other(_) => None,
    }
}
