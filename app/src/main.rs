//! # magicprinter
//!
//! Command-line front end for BLE thermal label printers.
//!
//! ```bash
//! # Find printers and note the id
//! magicprinter scan
//!
//! # Print an image (the printer is remembered for next time)
//! magicprinter print label.png --device 5b8f0c7e-...
//!
//! # Print the calibration pattern without any hardware
//! magicprinter --dry-run test-print
//!
//! # Write the TSPL command stream to a file
//! magicprinter encode label.png -o label.tspl
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use labelprinter::PeripheralId;
use magicprinter_lib::commands;
use magicprinter_lib::test_pattern::generate_test_label;

/// magicprinter - BLE thermal label printer utility
#[derive(Parser, Debug)]
#[command(name = "magicprinter")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Use a simulated printer instead of the Bluetooth radio
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan for nearby label printers
    Scan,

    /// Print an image file
    Print {
        /// Image to print (PNG, JPEG, ...)
        image: PathBuf,

        /// Printer id from `scan` (defaults to PRINTER_ADDRESS, then the saved printer)
        #[arg(long, value_name = "ID")]
        device: Option<PeripheralId>,
    },

    /// Print the built-in calibration pattern
    TestPrint {
        /// Printer id from `scan`
        #[arg(long, value_name = "ID")]
        device: Option<PeripheralId>,
    },

    /// Encode an image to a TSPL command file without printing
    Encode {
        image: PathBuf,

        /// Output file
        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },

    /// Show radio state and the saved printer
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Forget the saved printer
    Forget,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    magicprinter_lib::init_tracing();

    let cli = Cli::parse();
    let config = magicprinter_lib::init_config()?;
    let dry_run = cli.dry_run || config.dry_run_mode;

    match cli.command {
        Commands::Scan => {
            println!("Scanning for {}s...", config.scan_timeout_secs);
            let devices = commands::scan(&config, dry_run).await?;
            if devices.is_empty() {
                println!("No printers found.");
            }
            for device in devices {
                let rssi = device
                    .rssi
                    .map(|r| format!("{r} dBm"))
                    .unwrap_or_else(|| "-".into());
                println!("  {}  {:<24} {}", device.id, device.display_name(), rssi);
            }
        }
        Commands::Print { image, device } => {
            let image = commands::load_image(&image)?;
            let outcome = commands::print_image(&config, dry_run, image, device).await?;
            report_print(&outcome);
        }
        Commands::TestPrint { device } => {
            let image = generate_test_label(config.print_width_dots);
            let outcome = commands::print_image(&config, dry_run, image, device).await?;
            report_print(&outcome);
        }
        Commands::Encode { image, output } => {
            let buffer = commands::encode_file(&config, &image, &output)?;
            println!(
                "Wrote {} bytes ({} dots tall) to {}",
                buffer.len(),
                buffer.height_dots(),
                output.display()
            );
        }
        Commands::Status { json } => {
            let report = commands::status(&config, dry_run).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Radio:          {}", report.radio);
                if let Some(err) = &report.radio_error {
                    println!("                ({err})");
                }
                println!(
                    "Saved printer:  {}",
                    report.saved_printer.as_deref().unwrap_or("none")
                );
                if let Some(id) = &report.configured_printer {
                    println!("PRINTER_ADDRESS: {id}");
                }
                println!("Data directory: {}", report.data_dir);
                if report.dry_run {
                    println!("Dry run mode is enabled - no actual printing");
                }
            }
        }
        Commands::Forget => match commands::forget(&config)? {
            Some(id) => println!("Forgot printer {id}"),
            None => println!("No saved printer"),
        },
    }

    Ok(())
}

fn report_print(outcome: &commands::PrintOutcome) {
    println!(
        "Printed on {}: {} bytes in {} chunks ({:.1}s)",
        outcome.printer.display_name(),
        outcome.report.bytes,
        outcome.report.chunks,
        outcome.report.elapsed.as_secs_f32()
    );
    if let Some(path) = &outcome.dump {
        println!("Dry run output: {}", path.display());
    }
}
