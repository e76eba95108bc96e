use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tiger_probe::config::{Command, SendArgs};
use tiger_probe::core::accuracy::FileNameLabelPolicy;
use tiger_probe::domain::model::{AccuracySnapshot, SessionPhase};
use tiger_probe::utils::error::ErrorSeverity;
use tiger_probe::utils::{logger, validation::Validate};
use tiger_probe::{CliConfig, DeviceConfig, DeviceError, MeasurementReport, Session, SystemConnector};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliConfig::parse();

    // 初始化日誌
    if cli.log_json {
        logger::init_json_logger(cli.verbose);
    } else {
        logger::init_cli_logger(cli.verbose);
    }
    tracing::debug!("CLI config: {:?}", cli);

    // 載入設定檔 (沒有指定就使用預設值)
    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!("📁 Loading configuration from: {}", path);
            match DeviceConfig::from_file(path) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("❌ Failed to load config file '{}': {}", path, e);
                    eprintln!("💡 Make sure the file exists and is valid TOML format");
                    std::process::exit(1);
                }
            }
        }
        None => DeviceConfig::default(),
    };

    if let Command::Send(args) = &cli.command {
        args.apply_to(&mut config);
        if let Err(e) = args.validate() {
            exit_with(&e);
        }
    }

    // 驗證配置
    if let Err(e) = config.validate() {
        exit_with(&e);
    }

    match cli.command {
        Command::Ports => list_ports(),
        Command::CheckConfig => {
            println!("✅ Configuration is valid");
            let rendered = toml::to_string_pretty(&config).context("rendering configuration")?;
            println!("{}", rendered);
        }
        Command::Send(args) => {
            let worst = run_send(&args, &config).await;
            if let Some(severity) = worst {
                std::process::exit(exit_code(severity));
            }
        }
    }

    Ok(())
}

fn list_ports() {
    let session = Session::new(SystemConnector);
    match session.list_available_ports() {
        Ok(ports) if ports.is_empty() => println!("No COM ports found"),
        Ok(ports) => {
            for (index, port) in ports.iter().enumerate() {
                println!("{:>2}. {}", index + 1, port);
            }
        }
        Err(e) => exit_with(&e),
    }
}

/// Exit status after a second Ctrl-C, as a shell reports SIGINT.
const INTERRUPTED_EXIT: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InterruptAction {
    /// Close the link, finish the current image and skip the rest.
    StopBatch,
    Exit,
}

fn interrupt_action(count: u32) -> InterruptAction {
    if count <= 1 {
        InterruptAction::StopBatch
    } else {
        InterruptAction::Exit
    }
}

/// Sends every image in order; returns the worst failure severity, if any.
async fn run_send(args: &SendArgs, config: &DeviceConfig) -> Option<ErrorSeverity> {
    let session = Arc::new(Session::with_options(
        SystemConnector,
        FileNameLabelPolicy,
        config.session_options(),
    ));
    let transport = args.transport_config(config);
    tracing::info!("🚀 Sending {} image(s) over {}", args.images.len(), transport.kind());

    let interrupts = AtomicU32::new(0);
    let mut worst: Option<ErrorSeverity> = None;
    for (index, image) in args.images.iter().enumerate() {
        if interrupts.load(Ordering::SeqCst) > 0 {
            eprintln!("🛑 Interrupted, skipping {} remaining image(s)", args.images.len() - index);
            worst = worst.max(Some(ErrorSeverity::Medium));
            break;
        }
        let result =
            measure_one(&session, PathBuf::from(image), transport.clone(), args.json, &interrupts).await;
        match result {
            Ok(report) => print_report(&report, args.json),
            Err(e) => {
                if let Some(partial) = e.partial_telemetry().filter(|t| t.has_any_timing()) {
                    eprintln!("⚠️  Partial telemetry: {}", serde_json::to_string(partial).unwrap_or_default());
                }
                eprintln!("❌ {}: {}", image, e.user_friendly_message());
                eprintln!("💡 Suggestion: {}", e.recovery_suggestion());
                tracing::debug!("Category: {:?}, Severity: {:?}", e.category(), e.severity());
                worst = worst.max(Some(e.severity()));
            }
        }
    }

    print_accuracy(&session.get_accuracy(), args.json);
    worst
}

/// Runs one cycle off the main task and renders phase changes meanwhile.
/// Ctrl-C closes the link so a pending send or response wait ends
/// immediately; a second one exits.
async fn measure_one(
    session: &Arc<Session<SystemConnector>>,
    image: PathBuf,
    transport: tiger_probe::TransportConfig,
    quiet: bool,
    interrupts: &AtomicU32,
) -> Result<MeasurementReport, DeviceError> {
    let mut phases = session.subscribe();
    let worker = Arc::clone(session);
    let mut cycle =
        tokio::spawn(async move { worker.send_and_measure(&image, &transport).await });

    loop {
        tokio::select! {
            joined = &mut cycle => {
                return joined.map_err(|e| DeviceError::IoError(std::io::Error::other(e)))?;
            }
            Ok(phase) = phases.recv() => {
                if !quiet && matches!(phase, SessionPhase::Quantizing | SessionPhase::AwaitingResponse) {
                    eprintln!("⏳ {}", phase.status_text());
                }
            }
            Ok(()) = tokio::signal::ctrl_c() => {
                let count = interrupts.fetch_add(1, Ordering::SeqCst) + 1;
                match interrupt_action(count) {
                    InterruptAction::StopBatch => {
                        if session.abort() {
                            tracing::warn!("Interrupted, closing device link");
                        }
                        eprintln!("🛑 Stopping after this image (Ctrl-C again to quit now)");
                    }
                    InterruptAction::Exit => {
                        eprintln!("🛑 Interrupted");
                        std::process::exit(INTERRUPTED_EXIT);
                    }
                }
            }
        }
    }
}

fn print_report(report: &MeasurementReport, json: bool) {
    if json {
        match serde_json::to_string(report) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::error!("Could not serialize report: {}", e),
        }
        return;
    }

    let telemetry = &report.telemetry;
    let micros = |v: Option<u64>| v.map(|v| format!("{} µs", v)).unwrap_or_else(|| "---".to_string());

    println!("🖼️  Image: {}", report.image_name);
    println!(
        "   Result: {} (Confidence: {}%)",
        telemetry.predicted_class.map(|c| c.as_str()).unwrap_or("---"),
        telemetry.confidence_percent.map(|c| c.to_string()).unwrap_or_else(|| "---".to_string())
    );
    if let Some(tx) = report.tx_millis {
        println!("   TX Time:   {:.2} ms", tx);
    }
    println!("   RX Time:   {}", micros(telemetry.rx_micros));
    println!("   Inference: {}", micros(telemetry.infer_micros));
    println!("   Total:     {}", micros(telemetry.total_micros));
    if let Some(correct) = report.correct {
        println!("   Ground truth match: {}", if correct { "✅" } else { "❌" });
    }
}

fn print_accuracy(accuracy: &AccuracySnapshot, json: bool) {
    if json {
        if let Ok(line) = serde_json::to_string(accuracy) {
            println!("{}", line);
        }
        return;
    }

    match accuracy.ratio {
        Some(ratio) => println!(
            "📊 Accuracy: {:.1}% ({}/{})",
            ratio, accuracy.correct, accuracy.total
        ),
        None => println!("📊 Accuracy: ---"),
    }
}

fn exit_code(severity: ErrorSeverity) -> i32 {
    match severity {
        ErrorSeverity::Low => 0,
        ErrorSeverity::Medium => 2,
        ErrorSeverity::High => 1,
        ErrorSeverity::Critical => 3,
    }
}

fn exit_with(e: &DeviceError) -> ! {
    tracing::error!("❌ {} (Category: {:?})", e, e.category());
    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 Suggestion: {}", e.recovery_suggestion());
    std::process::exit(exit_code(e.severity()).max(1));
}
