//! Human-readable output for the CLI commands.

use facefind_core::matching::SearchTrace;
use facefind_core::person_search::{OutputSummary, PersonSearchResult};
use facefind_core::registration::{FileOutcome, RegistrationReport, SkipReason};
use facefind_core::{Provenance, QueryResult};
use std::io::{self, Write};
use std::path::Path;

pub fn registration(out: &mut impl Write, report: &RegistrationReport) -> io::Result<()> {
    for file in &report.files {
        let line = match &file.outcome {
            FileOutcome::Skipped(SkipReason::NoFace) => "skipped: no face".to_string(),
            FileOutcome::Skipped(SkipReason::MultipleFaces { count }) => {
                format!("skipped: {count} faces")
            }
            FileOutcome::Skipped(SkipReason::Unreadable { detail }) => {
                format!("skipped: unreadable ({detail})")
            }
            FileOutcome::Rejected { detail } => format!("rejected: {detail}"),
            _ => match &file.duplicate_of {
                Some(other) => format!("same content as {other}"),
                None => continue,
            },
        };
        writeln!(out, "  {}  {line}", file.path)?;
    }

    writeln!(
        out,
        "Registered {} of {} photos from {} in {:.1}s",
        report.registered_count,
        report.total_discovered,
        report.directory,
        report.elapsed_ms as f64 / 1000.0
    )?;
    if report.updated_count > 0 {
        writeln!(out, "  updated:            {}", report.updated_count)?;
    }
    writeln!(out, "  already registered: {}", report.already_registered_count)?;
    writeln!(
        out,
        "  skipped:            {} (no face {}, multiple faces {}, unreadable {})",
        report.skipped.total(),
        report.skipped.no_face,
        report.skipped.multiple_faces,
        report.skipped.unreadable
    )?;
    if report.rejected_count > 0 {
        writeln!(out, "  rejected:           {}", report.rejected_count)?;
    }
    if report.stale_removed > 0 {
        writeln!(out, "  outdated removed:   {}", report.stale_removed)?;
    }
    Ok(())
}

pub fn matches(out: &mut impl Write, matches: &[QueryResult]) -> io::Result<()> {
    if matches.is_empty() {
        return writeln!(out, "No matching photos");
    }
    writeln!(out, "{} matching photos:", matches.len())?;
    for (rank, m) in matches.iter().enumerate() {
        writeln!(
            out,
            "{:>3}. {:>5.1}%  {}",
            rank + 1,
            m.confidence * 100.0,
            m.image_path
        )?;
    }
    Ok(())
}

pub fn trace(out: &mut impl Write, trace: &SearchTrace) -> io::Result<()> {
    writeln!(out, "faces detected: {}", trace.faces_detected)?;
    writeln!(out, "indexed faces:  {}", trace.indexed_faces)?;
    writeln!(out, "metric:         {}", trace.metric)?;
    writeln!(out, "threshold:      {:.3}", trace.threshold)?;
    if let Some(rejection) = &trace.rejection {
        return writeln!(out, "query rejected: {rejection}");
    }
    for c in &trace.candidates {
        let verdict = if c.accepted { "accept" } else { "reject" };
        writeln!(
            out,
            "  {verdict}  distance {:.4}  confidence {:.4}  {}",
            c.distance, c.confidence, c.image_path
        )?;
    }
    writeln!(out, "{} of {} candidates accepted", trace.matches.len(), trace.candidates.len())
}

pub fn person_search(
    out: &mut impl Write,
    result: &PersonSearchResult,
    summary: Option<&OutputSummary>,
) -> io::Result<()> {
    writeln!(
        out,
        "{}: {} reference photos",
        result.person_name,
        result.references.len()
    )?;
    for error in &result.search_errors {
        writeln!(out, "  warning: {error}")?;
    }
    matches(out, &result.matches)?;

    if let Some(summary) = summary {
        writeln!(
            out,
            "Copied {} photos to {}",
            summary.copied_files.len(),
            summary.output_dir.display()
        )?;
        for skipped in &summary.skipped_files {
            writeln!(out, "  {skipped}")?;
        }
    }
    Ok(())
}

pub fn stats(
    out: &mut impl Write,
    db_path: &Path,
    faces: usize,
    provenance: Option<&Provenance>,
) -> io::Result<()> {
    writeln!(out, "database:  {}", db_path.display())?;
    writeln!(out, "faces:     {faces}")?;
    match provenance {
        Some(p) => {
            writeln!(out, "model:     {}", p.embedding_model)?;
            writeln!(out, "detector:  {}", p.detector_backend)?;
            writeln!(out, "dimension: {}", p.dimension)
        }
        None => writeln!(out, "model:     (empty index)"),
    }
}
