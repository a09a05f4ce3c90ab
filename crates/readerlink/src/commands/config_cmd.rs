//! Config subcommand handlers.

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::CliError;
use crate::output;

pub fn handle(args: &ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            output::print_output(&super::config_file(global).display().to_string());
        }

        ConfigCommand::Show => {
            let cfg = super::load_config(global)?;
            let active = cfg.active_profile_name(global.profile.as_deref());
            let runtime = super::resolve_controller_config(global, &cfg, None)?;

            let mut rendered = toml::to_string_pretty(&cfg)?;
            rendered.push_str(&format!(
                "\n# active profile: {active}\n\
                 # site_id = {}\n\
                 # discovery_method = {}\n\
                 # update_success_delay = {}\n\
                 # update_cancel_threshold = {}\n",
                runtime.site_id,
                runtime.discovery_method,
                humantime::format_duration(runtime.update_success_delay),
                runtime.update_cancel_threshold,
            ));
            output::print_output(rendered.trim_end());
        }
    }
    Ok(())
}
