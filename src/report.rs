//! End-of-run operator report.

use std::fmt::Write;

use crate::pipeline::link_qa::QaVerdict;
use crate::pipeline::runner::RunReport;

/// Plain-text summary of a run: costs, classification, skips, and QA.
pub fn render_console_report(report: &RunReport) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Run {} ({})", report.run_id, report.date_range);
    let _ = writeln!(out, "   Model: {}", report.model);
    let _ = writeln!(
        out,
        "   Emails: {} fetched, {} filtered out",
        report.fetched,
        report.filtered.len()
    );
    let _ = writeln!(
        out,
        "   Classifier: {} included, {} excluded, {} degraded",
        report.included(),
        report.excluded(),
        report.degraded()
    );

    if !report.filtered.is_empty() {
        out.push_str("\nFiltered:\n");
        for email in &report.filtered {
            let _ = writeln!(
                out,
                "   - {} ({}): {}",
                email.subject,
                email.sender,
                email.reason.label()
            );
        }
    }

    if !report.skipped.is_empty() {
        out.push_str("\nSkipped:\n");
        for skip in &report.skipped {
            let _ = writeln!(
                out,
                "   - [{}] {}: {} ({})",
                skip.stage,
                skip.subject,
                skip.kind.label(),
                skip.reason
            );
        }
    }

    if let Some((kind, reason)) = &report.synthesis_fallback {
        let _ = writeln!(
            out,
            "\nSynthesis fell back to per-email sections: {} ({})",
            kind.label(),
            reason
        );
    }

    if !report.synthesis_omitted.is_empty() || report.synthesis_unattributed > 0 {
        let _ = writeln!(
            out,
            "\nSynthesis: {} bullets left out, {} dropped without a known source",
            report.synthesis_omitted.len(),
            report.synthesis_unattributed
        );
        for bullet in &report.synthesis_omitted {
            let _ = writeln!(out, "   left out: \"{}\" ({})", bullet.text, bullet.link);
        }
    }

    let qa = &report.qa;
    let _ = writeln!(
        out,
        "\nLink QA: {} checked, {} corrected, {} unverifiable",
        qa.checked(),
        qa.corrected(),
        qa.unverifiable()
    );
    for entry in &qa.entries {
        match entry.verdict {
            QaVerdict::Corrected => {
                let _ = writeln!(
                    out,
                    "   corrected: \"{}\"\n      {} -> {}",
                    entry.bullet_text,
                    entry.original_link,
                    entry.corrected_link.as_deref().unwrap_or("")
                );
            }
            QaVerdict::Unverifiable => {
                let _ = writeln!(
                    out,
                    "   unverifiable: \"{}\" ({})",
                    entry.bullet_text,
                    entry.reason.as_deref().unwrap_or("no reason")
                );
            }
            QaVerdict::Confirmed => {}
        }
    }

    out.push_str("\nCosts:\n");
    let _ = writeln!(
        out,
        "   {:<12} {:>8} {:>8} {:>12} {:>12}",
        "stage", "in", "out", "cost", "total"
    );
    for record in &report.costs {
        let _ = writeln!(
            out,
            "   {:<12} {:>8} {:>8} {:>12} {:>12}{}",
            record.stage.label(),
            record.input_units,
            record.output_units,
            format!("${:.6}", record.cost_usd),
            format!("${:.6}", record.accumulated_usd),
            if record.estimated { " (est.)" } else { "" }
        );
    }
    for (stage, calls, cost) in &report.stage_totals {
        let _ = writeln!(out, "   {:<12} {:>3} calls {:>12}", stage.label(), calls, format!("${cost:.6}"));
    }
    let _ = writeln!(
        out,
        "   Total: ${:.4} over {} calls",
        report.total_cost,
        report.costs.len()
    );

    out
}
