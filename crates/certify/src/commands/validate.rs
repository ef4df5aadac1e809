use anyhow::{Context, Result, bail};
use appliance_harness::ConfigError;
use appliance_harness::config::ProvisioningConfig;
use certify::Suite;
use std::path::Path;

pub async fn run(suite_path: &Path, strict: bool) -> Result<()> {
    println!("Validating {}...", suite_path.display());

    let suite = Suite::from_file(suite_path)?;

    println!("✓ Suite valid");
    println!("  Name: {}", suite.name);
    match &suite.harness.provisioning {
        ProvisioningConfig::OpenNebula { template, .. } => {
            println!("  Backend: opennebula (template {})", template)
        }
        ProvisioningConfig::Static { host, .. } => println!("  Backend: static ({})", host),
    }
    println!("  Context parameters: {}", suite.harness.context.len());
    println!("  Checks: {}", suite.checks.len());
    for check in &suite.checks {
        let command = check.to_command()?;
        println!("    - {}: {}", check.name, command.to_shell_string());
    }

    match suite.harness.resolved_context() {
        Ok(_) => {}
        Err(ConfigError::EnvVarNotFound(names)) if !strict => {
            println!("  ⚠ Context references undefined environment variables: {}", names);
        }
        Err(ConfigError::EnvVarNotFound(names)) => {
            bail!("undefined environment variables: {}", names)
        }
        Err(e) => return Err(e).context("Failed to resolve context"),
    }

    Ok(())
}
