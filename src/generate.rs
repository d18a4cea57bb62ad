//! `forge generate`: run one requirement through the full pipeline and
//! print the validated test cases and their scripts.

use anyhow::Result;

use caseforge_core::models::GenerationOutput;

use crate::app::App;
use crate::config::Config;

pub async fn run_generate(
    config: &Config,
    requirement: &str,
    framework: Option<String>,
    json: bool,
) -> Result<()> {
    let app = App::open(config).await?;
    let orchestrator = app.orchestrator()?;

    let output = orchestrator.run("cli", requirement, framework).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_output(&output);
    }

    app.pool.close().await;
    Ok(())
}

fn print_output(output: &GenerationOutput) {
    for case in &output.test_cases {
        println!("{}  {}", case.id, case.title);
        if let Some(desc) = &case.description {
            println!("  {}", desc);
        }
        if !case.preconditions.is_empty() {
            println!("  preconditions:");
            for p in &case.preconditions {
                println!("    - {}", p);
            }
        }
        println!("  steps:");
        for (i, step) in case.steps.iter().enumerate() {
            println!("    {}. {} -> {}", i + 1, step.action, step.expected);
        }
        println!("  expected: {}", case.expected_result);
        if !case.provenance.is_empty() {
            println!("  provenance: {}", case.provenance.join(", "));
        }
        println!();
    }

    for script in &output.scripts {
        println!("--- {} ({}) ---", script.id, script.framework);
        println!("{}", script.code);
        println!();
    }
}
