// src/banner.rs

/// Prints the startup banner to the console.
pub fn print_banner() {
    let banner = r#"
                               _                     _
  ___  ___ _ ____   _____| |__   ___ _ __   ___| |__
 / __|/ _ \ '__\ \ / / _ \ '_ \ / _ \ '_ \ / __| '_ \
 \__ \  __/ |   \ V /  __/ |_) |  __/ | | | (__| | | |
 |___/\___|_|    \_/ \___|_.__/ \___|_| |_|\___|_| |_|

    Serving Accuracy Benchmark Harness
"#;
    println!("{}", banner);
}
