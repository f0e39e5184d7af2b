//! Plain (human-readable) summary output.

use anstream::println;
use owo_colors::OwoColorize;

use crate::summary::{ImageCount, Summary};

pub(crate) fn render_summary(summary: &Summary) {
    println!(
        "{scanned} {nrepos} repositor{ies}, {nimages} unique image{s}",
        scanned = "Scanned".bold(),
        nrepos = summary.total_repositories_scanned.green(),
        ies = if summary.total_repositories_scanned == 1 { "y" } else { "ies" },
        nimages = summary.total_unique_images.green(),
        s = if summary.total_unique_images == 1 { "" } else { "s" },
    );

    if summary.total_rows() == 0 {
        println!("{}", "No image references found.".yellow());
    } else {
        println!(
            "{ncompliant} compliant, {nnon} non-compliant, {npipeline} non-compliant in build pipelines",
            ncompliant = summary.compliant_count.green(),
            nnon = summary.non_compliant_count.red(),
            npipeline = summary.pipeline_non_compliant_count.bright_red(),
        );
    }

    render_breakdown("Compliant images", &summary.compliant_images);
    render_breakdown("Non-compliant images in build pipelines", &summary.pipeline_images);

    let diagnostics = &summary.diagnostics;
    let mut qualifiers = vec![];

    if diagnostics.unresolved > 0 {
        qualifiers.push(format!(
            "{n} unresolved",
            n = diagnostics.unresolved.bright_yellow()
        ));
    }

    if diagnostics.unparseable > 0 {
        qualifiers.push(format!(
            "{n} unparseable",
            n = diagnostics.unparseable.bright_yellow()
        ));
    }

    if diagnostics.skipped_repositories > 0 {
        qualifiers.push(format!(
            "{n} skipped repositor{ies}",
            n = diagnostics.skipped_repositories.bright_yellow(),
            ies = if diagnostics.skipped_repositories == 1 { "y" } else { "ies" },
        ));
    }

    if !qualifiers.is_empty() {
        println!();
        println!("{}: {}", "Diagnostics".bold(), qualifiers.join(", "));
    }
}

fn render_breakdown(title: &str, counts: &[ImageCount]) {
    if counts.is_empty() {
        return;
    }

    println!();
    println!("{}:", title.bold());
    for count in counts {
        println!(
            "  {image}: {count} ({percentage:.1}%)",
            image = count.image.cyan(),
            count = count.count,
            percentage = count.percentage,
        );
    }
}
