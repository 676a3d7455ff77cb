//! Per-group HTML reports.
//!
//! A report has a totals header, a table of successful tasks and a table of
//! failures. It is always written to `workdir/reports/{group}.html`, and
//! additionally mailed when SMTP is configured.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::config::Config;
use crate::group::{TaskGroup, TaskOutcome};
use crate::mail;

/// `HH:MM:SS.mmm`, or the dashed placeholder for unset (< 0) durations.
pub(crate) fn format_duration_ms(milliseconds: i64) -> String {
    if milliseconds < 0 {
        return "--:--:--.---".to_string();
    }
    let millis = milliseconds % 1000;
    let seconds = milliseconds / 1000;
    let minutes = seconds / 60;
    let hours = minutes / 60;
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        hours,
        minutes % 60,
        seconds % 60,
        millis
    )
}

/// `NN.NN%`, or `-` when the metric was not reported.
pub(crate) fn format_accuracy(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.2}%", 100.0 * v),
        None => "-".to_string(),
    }
}

/// Render the full report HTML for one group.
pub fn render(name: &str, total: usize, results: &BTreeMap<String, TaskOutcome>) -> String {
    let mut successes = Vec::new();
    let mut failures = Vec::new();
    for (task_id, outcome) in results {
        match outcome {
            TaskOutcome::Success { .. } => successes.push((task_id, outcome)),
            TaskOutcome::Fail { .. } => failures.push((task_id, outcome)),
        }
    }

    format!(
        r#"<div style="width: 80%; margin-left: 10%">
    <h3>Group {name} Finished</h3>
    <p>{total} tasks total, {success} successful, {failed} failed.</p>
    <HR style="FILTER: alpha(opacity=100,finishopacity=0,style=1)" width="100%" color=#987cb9 SIZE=3>
    <div>
        <p>Successful:</p>
        {success_table}
    </div>
    <div>
        <p>Exception:</p>
        {fail_table}
    </div>
</div>"#,
        name = name,
        total = total,
        success = successes.len(),
        failed = failures.len(),
        success_table = success_table(&successes),
        fail_table = fail_table(&failures),
    )
}

fn success_table(rows: &[(&String, &TaskOutcome)]) -> String {
    let mut out = String::from(
        "<table border>\
         <tr><td>task id</td><td>train acc</td><td>val acc</td>\
         <td>data</td><td>load time</td><td>train time</td></tr>",
    );
    for (task_id, outcome) in rows {
        if let TaskOutcome::Success {
            train_acc,
            val_acc,
            data,
            load_time,
            train_time,
        } = outcome
        {
            out.push_str(&format!(
                "<tr><td>{task_id}</td><td>{train_acc}</td><td>{val_acc}</td>\
                 <td>{data}</td><td>{load_time}</td><td>{train_time}</td></tr>"
            ));
        }
    }
    out.push_str("</table>");
    out
}

fn fail_table(rows: &[(&String, &TaskOutcome)]) -> String {
    let mut out =
        String::from("<table border><tr><td>task id</td><td>stage</td><td>message</td></tr>");
    for (task_id, outcome) in rows {
        if let TaskOutcome::Fail { stage, message } = outcome {
            out.push_str(&format!(
                "<tr><td>{task_id}</td><td>{stage}</td><td>{message}</td></tr>"
            ));
        }
    }
    out.push_str("</table>");
    out
}

/// Write the group's report under `workdir/reports/` and mail it when SMTP
/// is enabled. Mail failures are logged, never fatal.
pub fn deliver(config: &Config, group: &TaskGroup) -> Result<PathBuf> {
    let name = group.group_name();
    let html = render(&name, group.task_number(), group.results());

    if config.smtp.enable {
        match mail::send_group_report(&config.smtp, &name, &html) {
            Ok(true) => info!(group = %name, "group report mailed"),
            Ok(false) => info!(group = %name, "mail skipped: incomplete SMTP settings"),
            Err(e) => error!(group = %name, "send group report mail failed: {e:#}"),
        }
    }

    let reports_dir = config.workdir.join("reports");
    std::fs::create_dir_all(&reports_dir)
        .with_context(|| format!("create reports dir {}", reports_dir.display()))?;
    let path = reports_dir.join(format!("{name}.html"));
    std::fs::write(&path, html.as_bytes())
        .with_context(|| format!("write report {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration_ms(0), "00:00:00.000");
        assert_eq!(format_duration_ms(3723004), "01:02:03.004");
        assert_eq!(format_duration_ms(-1), "--:--:--.---");
    }

    #[test]
    fn accuracy_formatting() {
        assert_eq!(format_accuracy(Some(0.9)), "90.00%");
        assert_eq!(format_accuracy(Some(0.12345)), "12.35%");
        assert_eq!(format_accuracy(None), "-");
    }

    #[test]
    fn report_splits_success_and_failure_tables() {
        let mut results = BTreeMap::new();
        results.insert(
            "ok-task".to_string(),
            TaskOutcome::Success {
                train_acc: "90.00%".into(),
                val_acc: "80.00%".into(),
                data: "{}".into(),
                load_time: "00:00:00.010".into(),
                train_time: "00:00:01.000".into(),
            },
        );
        results.insert(
            "bad-task".to_string(),
            TaskOutcome::Fail {
                stage: "load".into(),
                message: "LoadNumbersExceed".into(),
            },
        );

        let html = render("exp-1", 2, &results);
        assert!(html.contains("Group exp-1 Finished"));
        assert!(html.contains("2 tasks total, 1 successful, 1 failed."));
        assert!(html.contains("<td>ok-task</td><td>90.00%</td><td>80.00%</td>"));
        assert!(html.contains("<td>bad-task</td><td>load</td><td>LoadNumbersExceed</td>"));
    }
}
