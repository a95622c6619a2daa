pub fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;208m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
  _           _
 | |__   ___ | |_ ___ _   _  ___
 | '_ \ / _ \| __/ __| | | |/ _ \
 | | | | (_) | || (__| |_| |  __/
 |_| |_|\___/ \__\___|\__,_|\___|
            orchestrator"#;
    const APP_DESCRIPTION: &str =
        "Ordered ingestion of DJ hotcue events from producer connections over TCP.";
    const LIABILITY_NOTICE: &str =
        "MIT License disclaimer: software is provided \"AS IS\", without warranty or liability.";

    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    println!(
        "{} v{} | build {} ({})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("HOTCUE_BUILD_DATE_UTC"),
        env!("HOTCUE_BUILD_REVISION")
    );
    println!("{APP_DESCRIPTION}");
    println!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}");
    println!();
    println!("================================================================");
    println!();
}
