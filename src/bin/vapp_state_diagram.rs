//! Render the vApp transition table as a Mermaid state diagram.
//!
//! Usage:
//!   cargo run --bin vapp_state_diagram                     # stdout
//!   cargo run --bin vapp_state_diagram -- --out VAPP_STATES.md

use std::path::PathBuf;

use ssvirt_reconciler::controller::vapp_evaluator::TRANSITIONS;
use ssvirt_reconciler::store::VAppStatus;

const ALL: [VAppStatus; 5] = [
    VAppStatus::Instantiating,
    VAppStatus::Deployed,
    VAppStatus::Deleting,
    VAppStatus::Deleted,
    VAppStatus::Failed,
];

fn main() -> anyhow::Result<()> {
    let out: Option<PathBuf> = std::env::args()
        .skip_while(|a| a != "--out")
        .nth(1)
        .map(PathBuf::from);

    let md = generate();
    match out {
        Some(path) => {
            std::fs::write(&path, &md)?;
            eprintln!("wrote {}", path.display());
        }
        None => print!("{md}"),
    }
    Ok(())
}

fn generate() -> String {
    let mut out = String::new();
    out.push_str("# vApp State Machine\n\n");
    out.push_str("Generated from `TRANSITIONS` in `controller/vapp_evaluator.rs`.\n\n");
    out.push_str("```mermaid\nstateDiagram-v2\n");
    out.push_str(&format!("    [*] --> {}\n", VAppStatus::Instantiating));

    for t in TRANSITIONS {
        let to = t.to;
        match t.from {
            Some(from) => out.push_str(&format!("    {from} --> {to} : {}\n", t.trigger)),
            // Wildcard rows expand to every other state.
            None => {
                for from in ALL.iter().filter(|s| **s != to) {
                    let line = format!("    {from} --> {to} : {}\n", t.trigger);
                    if !out.contains(&line) {
                        out.push_str(&line);
                    }
                }
            }
        }
    }

    out.push_str(&format!("    {} --> [*]\n", VAppStatus::Deleted));
    out.push_str("```\n");
    out
}
