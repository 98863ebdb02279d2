//! Presentation of extension listings.
use crate::controller::ListedProcess;

const EXTENSION_HEADER: &str = "EXTENSION";
const PID_HEADER: &str = "PID";
const COLUMN_GAP: usize = 2;

/// Renders `listing` as an aligned two-column table. An empty listing renders the
/// header only.
pub fn render_table(listing: &[ListedProcess]) -> String {
    let width = listing
        .iter()
        .map(|row| row.extension.len())
        .chain(std::iter::once(EXTENSION_HEADER.len()))
        .max()
        .unwrap_or_default()
        + COLUMN_GAP;

    let mut out = format!("{EXTENSION_HEADER:<width$}{PID_HEADER}\n");
    for row in listing {
        out.push_str(&format!("{:<width$}{}\n", row.extension, row.pid));
    }
    out
}

/// Renders `listing` as a JSON array.
pub fn render_json(listing: &[ListedProcess]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(listing)
}
