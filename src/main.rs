use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use log::info;
use ndisdump::{
    CaptureError, CaptureOptions, Capturer, Platform, effective_snaplen, ethernet_listing,
    native_interfaces,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 输出的 pcapng 文件（已存在时追加）
    #[arg(short = 'w', value_name = "FILE")]
    output: Option<PathBuf>,

    /// 列出以太网网卡后退出
    #[arg(short = 'D', long)]
    list_interfaces: bool,

    /// 每个数据包保留的字节数，小于等于 0 表示 262144
    #[arg(short = 's', long = "snapshot-length", value_name = "N", allow_negative_numbers = true)]
    snaplen: Option<i64>,

    /// JSON 格式的捕获配置文件
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// 过滤表达式（接受但不生效）
    #[arg(value_name = "EXPR")]
    expr: Vec<String>,
}

fn load_options(args: &Args) -> Result<CaptureOptions> {
    let mut options = match &args.config_file {
        Some(path) => CaptureOptions::from_json_file(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => CaptureOptions::default(),
    };

    // 命令行参数优先级高于配置文件
    if let Some(output) = &args.output {
        options.output = output.clone();
    }
    if let Some(snaplen) = args.snaplen {
        options.snaplen = effective_snaplen(snaplen);
    }
    if !args.expr.is_empty() {
        options.filter = args.expr.join(" ");
    }
    Ok(options)
}

fn list_interfaces() -> Result<()> {
    let interfaces = native_interfaces()?.list()?;
    for line in ethernet_listing(&interfaces) {
        println!("{}", line);
    }
    Ok(())
}

fn run(args: Args) -> Result<()> {
    if args.list_interfaces {
        return list_interfaces();
    }

    let options = load_options(&args)?;
    if options.output.as_os_str().is_empty() {
        Args::command()
            .error(ErrorKind::MissingRequiredArgument, "an output file is required (-w FILE)")
            .exit();
    }

    let platform = Platform::native()?;
    let capturer = Capturer::new(options);
    let summary = capturer.capture(&platform)?;
    info!(
        "{} packets captured, {} events dropped",
        summary.packets, summary.dropped
    );
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("error: {:#}", e);
        let code = e
            .downcast_ref::<CaptureError>()
            .map(CaptureError::exit_code)
            .unwrap_or(1);
        process::exit(code);
    }
}
