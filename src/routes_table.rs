//! Startup route table.
//!
//! ```text
//! Registered routes (3):
//! ┌──────────────────────────────────────────────────────
//! │METHOD │ PATH                      │ HANDLER
//! ├──────────────────────────────────────────────────────
//! │GET    │ /api/v1/me                │ me
//! │POST   │ /api/v1/refresh           │ refresh
//! ├──────────────────────────────────────────────────────
//! │GET    │ /livez                    │ liveness
//! └──────────────────────────────────────────────────────
//! ```
//!
//! Rows are grouped by first path segment, groups sorted by name, rows by
//! path and then method.

use std::collections::BTreeMap;
use std::fmt::Write;

use colored::{ColoredString, Colorize};

use crate::method::Method;
use crate::router::RouteInfo;

const METHOD_WIDTH: usize = 6;
const PATH_WIDTH: usize = 60;
const HANDLER_WIDTH: usize = 36;
const SEP: &str = " │ ";

fn paint(method: Method, cell: &str) -> ColoredString {
    match method {
        Method::Get => cell.green(),
        Method::Post => cell.cyan(),
        Method::Put => cell.yellow(),
        Method::Delete => cell.red(),
        Method::Patch => cell.blue(),
        Method::Head => cell.magenta(),
        _ => cell.normal(),
    }
}

/// Renders `routes` as a box-drawn table. `ansi` colours the method column.
pub fn render(routes: &[RouteInfo], ansi: bool) -> String {
    let mut groups: BTreeMap<&str, Vec<&RouteInfo>> = BTreeMap::new();
    for route in routes {
        groups.entry(first_segment(&route.path)).or_default().push(route);
    }

    let width = 1 + METHOD_WIDTH + SEP.len() + PATH_WIDTH + SEP.len() + HANDLER_WIDTH;
    let rule = "─".repeat(width - 1);

    let mut out = String::new();
    let _ = writeln!(out, "\nRegistered routes ({}):", routes.len());
    let _ = writeln!(out, "┌{rule}");
    let _ = writeln!(
        out,
        "│{:<mw$}{SEP}{:<pw$}{SEP}{:<hw$}",
        "METHOD",
        "PATH",
        "HANDLER",
        mw = METHOD_WIDTH,
        pw = PATH_WIDTH,
        hw = HANDLER_WIDTH,
    );
    let _ = writeln!(out, "├{rule}");

    let count = groups.len();
    for (i, (_, mut rows)) in groups.into_iter().enumerate() {
        rows.sort_by(|a, b| a.path.cmp(&b.path).then(a.method.cmp(&b.method)));
        for row in rows {
            let method = format!("{:<mw$}", crop(row.method.as_str(), METHOD_WIDTH), mw = METHOD_WIDTH);
            let method = if ansi { paint(row.method, &method).to_string() } else { method };
            let _ = writeln!(
                out,
                "│{method}{SEP}{:<pw$}{SEP}{:<hw$}",
                crop(&row.path, PATH_WIDTH),
                crop(&row.handler, HANDLER_WIDTH),
                pw = PATH_WIDTH,
                hw = HANDLER_WIDTH,
            );
        }
        if i + 1 < count {
            let _ = writeln!(out, "├{rule}");
        }
    }
    let _ = writeln!(out, "└{rule}");
    out
}

/// Prints the table to stdout.
pub fn print(routes: &[RouteInfo]) {
    print!("{}", render(routes, true));
}

fn first_segment(path: &str) -> &str {
    if path == "/" {
        return "/";
    }
    path.trim_start_matches('/').split('/').next().unwrap_or(path)
}

fn crop(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_owned();
    }
    let mut cropped: String = s.chars().take(width.saturating_sub(1)).collect();
    cropped.push('…');
    cropped
}
