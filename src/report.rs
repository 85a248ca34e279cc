//! Human-readable run report.
//!
//! Printed after every run, partial failures included: sites grouped by
//! outcome, per-account totals, and a ranked list of the most common
//! failure messages.

use std::collections::HashMap;
use std::time::Duration;

use crate::models::CheckinStatus;
use crate::provider::Credential;
use crate::state::StateStore;

struct AccountLine {
    label: String,
    ok: bool,
    detail: String,
}

pub fn print_run_report(state: &StateStore, credentials: &[Credential], elapsed: Duration) {
    let labels: Vec<&str> = credentials.iter().map(|c| c.label.as_str()).collect();

    let mut succeeded: Vec<(String, Vec<AccountLine>)> = Vec::new();
    let mut failed: Vec<(String, Vec<AccountLine>)> = Vec::new();
    let mut skipped: Vec<(String, Option<String>)> = Vec::new();

    for (key, site) in state.sites() {
        if site.removed {
            continue;
        }
        if site.skip {
            skipped.push((site.name.clone(), site.skip_reason.clone()));
            continue;
        }

        let mut lines = Vec::new();
        let mut any_fail = false;
        for label in &labels {
            let Some(account) = site.accounts.get(*label) else {
                continue;
            };
            if account.excluded {
                continue;
            }
            let status = state.effective_status(key, label);
            let (ok, detail) = match status {
                CheckinStatus::Success => (
                    true,
                    account
                        .checkin_msg
                        .clone()
                        .unwrap_or_else(|| "checked in".to_string()),
                ),
                CheckinStatus::AlreadyChecked => (true, "already checked in today".to_string()),
                CheckinStatus::Failed => (
                    false,
                    account
                        .checkin_msg
                        .clone()
                        .unwrap_or_else(|| "failed".to_string()),
                ),
                CheckinStatus::Pending => (false, "not attempted".to_string()),
            };
            any_fail |= !ok;
            lines.push(AccountLine {
                label: label.to_string(),
                ok,
                detail,
            });
        }

        if lines.is_empty() {
            continue;
        }
        if any_fail {
            failed.push((site.name.clone(), lines));
        } else {
            succeeded.push((site.name.clone(), lines));
        }
    }

    println!("\n{}", "=".repeat(70));
    println!("Run report");
    println!("{}", "=".repeat(70));

    if !succeeded.is_empty() {
        println!("\n  [OK] all accounts done ({} sites)", succeeded.len());
        println!("  {}", "-".repeat(50));
        for (name, lines) in &succeeded {
            let who: Vec<&str> = lines.iter().map(|l| l.label.as_str()).collect();
            println!("  {name} [{}]", who.join(", "));
            for line in lines {
                println!("    {}: {}", line.label, line.detail);
            }
        }
    }

    if !failed.is_empty() {
        println!("\n  [FAIL] some accounts failed ({} sites)", failed.len());
        println!("  {}", "-".repeat(50));
        for (name, lines) in &failed {
            let ok = lines.iter().filter(|l| l.ok).count();
            let bad = lines.len() - ok;
            println!("  {name} (ok: {ok}, failed: {bad})");
            for line in lines {
                let tag = if line.ok { "[OK]" } else { "[FAIL]" };
                println!("    {tag} {}: {}", line.label, line.detail);
            }
        }
    }

    if !skipped.is_empty() {
        println!("\n  [SKIP] {} sites", skipped.len());
        println!("  {}", "-".repeat(50));
        for (name, reason) in &skipped {
            match reason {
                Some(reason) if !reason.is_empty() => println!("  {name}: {reason}"),
                _ => println!("  {name}"),
            }
        }
    }

    let summary = state.summary();
    let effective = summary.success + summary.already_checked;
    let pct = if summary.total_tasks > 0 {
        effective * 100 / summary.total_tasks
    } else {
        0
    };

    println!("\n{}", "=".repeat(70));
    println!("Run statistics");
    println!("{}", "=".repeat(70));
    println!("  elapsed: {:.1}s", elapsed.as_secs_f64());
    println!(
        "  sites: ok {} | failed {} | skipped {}",
        succeeded.len(),
        failed.len(),
        skipped.len()
    );
    println!(
        "  tasks: {} | success: {} | already: {} | failed: {} | pending: {}",
        summary.total_tasks,
        summary.success,
        summary.already_checked,
        summary.failed,
        summary.pending
    );
    println!("  effective: {effective}/{} ({pct}%)", summary.total_tasks);

    // Per-account totals.
    println!("\n  by account:");
    for label in &labels {
        let mut ok = 0;
        let mut already = 0;
        let mut bad = 0;
        let mut total = 0;
        for (key, site) in state.sites() {
            if !site.active() {
                continue;
            }
            let Some(account) = site.accounts.get(*label) else {
                continue;
            };
            if account.excluded {
                continue;
            }
            total += 1;
            match state.effective_status(key, label) {
                CheckinStatus::Success => ok += 1,
                CheckinStatus::AlreadyChecked => already += 1,
                _ => bad += 1,
            }
        }
        println!(
            "    {label:12} success: {ok:>2} | already: {already:>2} | failed: {bad:>2} | total {total}"
        );
    }

    // Ranked failure messages.
    let mut reasons: HashMap<String, usize> = HashMap::new();
    for (_, lines) in &failed {
        for line in lines.iter().filter(|l| !l.ok) {
            *reasons.entry(line.detail.clone()).or_default() += 1;
        }
    }
    if !reasons.is_empty() {
        let mut ranked: Vec<(String, usize)> = reasons.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        println!("\n  failure reasons:");
        for (reason, count) in ranked {
            println!("    {reason}: {count}x");
        }
    }
}
