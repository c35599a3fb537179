use crate::cli::ConfigAction;
use anyhow::Result;
use console::{Term, style};
use dialoguer::Confirm;
use ferry::ConfigManager;

pub async fn handle_config(config_manager: &mut ConfigManager, action: ConfigAction) -> Result<()> {
    let term = Term::stdout();

    match action {
        ConfigAction::Show => {
            let config_content = std::fs::read_to_string(config_manager.config_file())?;
            term.write_line(&format!("{} Current configuration:", style("⚙️").cyan()))?;
            term.write_line("")?;
            term.write_line(&config_content)?;

            if let Err(e) = config_manager.validate() {
                term.write_line(&format!("{} {}", style("⚠️").yellow(), e))?;
            }
        }

        ConfigAction::Path => {
            term.write_line(&config_manager.config_file().display().to_string())?;
        }

        ConfigAction::Reset { yes } => {
            if !yes {
                let confirmed = Confirm::new()
                    .with_prompt(format!(
                        "Are you sure you want to reset {}?",
                        style(config_manager.config_file().display()).cyan()
                    ))
                    .default(false)
                    .interact()?;

                if !confirmed {
                    term.write_line(&format!("{} Operation cancelled", style("❌").red()))?;
                    return Ok(());
                }
            }

            config_manager.reset()?;
            term.write_line(&format!(
                "{} Configuration reset to defaults",
                style("✅").green()
            ))?;
        }
    }
    Ok(())
}
