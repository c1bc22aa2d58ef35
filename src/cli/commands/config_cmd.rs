//! `sfetch config` command.

use console::style;

use stealthfetch::Settings;

/// Print the effective settings, with proxy passwords masked.
pub fn cmd_config_show(settings: &Settings) -> anyhow::Result<()> {
    if let Err(e) = settings.validate() {
        eprintln!("{} Configuration is invalid: {}", style("!").yellow(), e);
    }
    print!("{}", toml::to_string_pretty(&settings.redacted())?);
    Ok(())
}
