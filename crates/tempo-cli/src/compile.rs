//! Compile command: send a schema to the compiler service.

use std::path::Path;

use anyhow::Context;
use tempo_core::{CompilerClient, TempoConfig};

use crate::colors;

pub async fn execute(schema: &Path, config: &TempoConfig) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(schema)
        .with_context(|| format!("Failed to read schema {}", schema.display()))?;

    let client = CompilerClient::new(&config.compiler_url)?;
    eprintln!(
        "{}Compiling{} {} via {}",
        colors::BOLD,
        colors::RESET,
        schema.display(),
        client.endpoint()
    );

    let result = client.compile(&source).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    eprintln!(
        "{}Compiled{} {} outputs, {} inputs",
        colors::GREEN,
        colors::RESET,
        result.output_schema.len(),
        result.input_form_schema.len()
    );
    Ok(())
}
