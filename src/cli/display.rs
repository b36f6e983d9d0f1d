//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use crate::cluster::{ImportReport, ProvisionReport};
use crate::types::Cluster;

const COLUMN_GAP: &str = "   ";

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let render = |cells: &mut dyn Iterator<Item = String>| {
        let line = cells
            .zip(&widths)
            .map(|(cell, width)| format!("{:width$}", cell, width = *width))
            .collect::<Vec<_>>()
            .join(COLUMN_GAP);
        format!("{}\n", line.trim_end())
    };

    let mut output = render(&mut headers.iter().map(|h| h.to_uppercase()));
    for row in rows {
        output.push_str(&render(&mut row.into_iter()));
    }
    output
}

/// `get clusters` table
pub fn format_cluster_list(clusters: &[Cluster]) -> String {
    if clusters.is_empty() {
        return "No clusters found.\n".to_string();
    }
    let headers = &["NAME", "SERVER", "WORKERS", "RUNNING", "NETWORK"];
    let rows = clusters
        .iter()
        .map(|c| {
            let running = c.nodes().filter(|n| n.running).count();
            vec![
                c.name.clone(),
                c.server
                    .as_ref()
                    .map(|s| s.name.clone())
                    .unwrap_or_else(|| "-".to_string()),
                c.workers.len().to_string(),
                format!("{}/{}", running, c.node_count()),
                c.nodes()
                    .next()
                    .map(|n| n.network.clone())
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| c.network_name()),
            ]
        })
        .collect();
    format_table(headers, rows)
}

pub fn format_provision_report(cluster: &str, report: &ProvisionReport) -> String {
    let mut output = format!("Cluster '{}' on network '{}'\n", cluster, report.network);
    if let Some(server) = &report.server {
        output.push_str(&format!("  server  {}\n", server));
    }
    for worker in &report.workers {
        match &worker.error {
            None => output.push_str(&format!("  worker  {}\n", worker.name)),
            Some(e) => output.push_str(&format!("  worker  {}  FAILED: {}\n", worker.name, e)),
        }
    }
    output
}

pub fn format_import_report(cluster: &str, report: &ImportReport) -> String {
    let mut output = String::new();
    for node in &report.nodes {
        match &node.result {
            Ok(()) => output.push_str(&format!("  {}  imported\n", node.node)),
            Err(e) => output.push_str(&format!("  {}  FAILED: {}\n", node.node, e)),
        }
    }
    let failed = report.failed().count();
    if failed == 0 {
        output.push_str(&format!("Imported images into all nodes of '{}'\n", cluster));
    } else {
        output.push_str(&format!(
            "Import failed on {} of {} nodes of '{}'\n",
            failed,
            report.nodes.len(),
            cluster
        ));
    }
    output
}
