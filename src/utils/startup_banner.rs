use crate::utils::runtime::RunMode;

pub fn print_startup_banner(mode: RunMode) {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;107m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
   ____ ___  _ ____   _____  __  __
  / ___/ _ \| '_ \ \ / / _ \|  \/  |
 | (_| (_) | | | \ V / (_) |\  / /
  \___\___/|_| |_|\_/ \___/  |_/_/ "#;
    const APP_DESCRIPTION: &str =
        "Multi-node systemd unit orchestration: controller and node agent over TCP.";

    println!("{BANNER_COLOR}{BANNER}{RESET}");
    println!();
    println!(
        "{} v{} | {} mode | build {} ({})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        mode.as_str(),
        env!("CONVOY_BUILD_DATE_UTC"),
        env!("CONVOY_GIT_REVISION")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}Software is provided \"AS IS\", without warranty of any kind.{RESET}");
    println!();
    println!("================================================================");
    println!();
}
