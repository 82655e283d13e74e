//! ftlink CLI
//!
//! 命令行客户端：通过 BLE 或 Wifi 访问设备文件系统

mod output;

use anyhow::{Context, Result, bail};
use clap::{ArgGroup, Parser, Subcommand};
use ftlink_core::{ConnectionManager, Settings, TransportKind, WifiFileTransferSession};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ftlink", version, about = "设备文件传输工具 (BLE / Wifi)")]
#[command(group(ArgGroup::new("target").required(true).args(["ble", "host"])))]
struct Cli {
    /// BLE 外设地址 (例如 AA:BB:CC:DD:EE:FF)
    #[arg(long, value_name = "ADDR")]
    ble: Option<String>,
    /// Wifi 设备主机名或 IP
    #[arg(long, value_name = "HOST")]
    host: Option<String>,
    /// Wifi HTTP 端口 (覆盖配置文件)
    #[arg(short, long)]
    port: Option<u16>,
    /// Wifi 访问密码 (覆盖配置文件)
    #[arg(long)]
    password: Option<String>,
    /// 建立连接的超时时间 (秒)
    #[arg(short, long)]
    timeout: Option<u64>,
    /// 单次 BLE 写入的最大长度
    #[arg(long)]
    max_write_len: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 列出目录
    Ls {
        /// 设备上的目录路径
        #[arg(default_value = "/")]
        path: String,
        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
    },
    /// 下载文件
    Get {
        /// 设备上的文件路径
        remote: String,
        /// 本地保存路径 (默认: 当前目录下同名文件)
        local: Option<PathBuf>,
    },
    /// 上传文件
    Put {
        /// 本地文件路径
        local: PathBuf,
        /// 设备上的目标路径
        remote: String,
    },
    /// 删除文件或空目录
    Rm { path: String },
    /// 移动或重命名 (仅 BLE)
    Mv { from: String, to: String },
    /// 创建目录
    Mkdir { path: String },
    /// 查看设备信息 (仅 Wifi)
    Version,
}

impl Cli {
    fn settings(&self) -> Settings {
        let mut settings = Settings::load();
        if let Some(port) = self.port {
            settings.wifi_port = port;
        }
        if let Some(password) = &self.password {
            settings.wifi_password = Some(password.clone());
        }
        if let Some(timeout) = self.timeout {
            settings.connection_timeout_secs = timeout;
        }
        if let Some(len) = self.max_write_len {
            settings.max_write_len = len;
        }
        settings
    }

    fn target(&self) -> Result<(&str, TransportKind)> {
        match (&self.ble, &self.host) {
            (Some(addr), None) => Ok((addr, TransportKind::Ble)),
            (None, Some(host)) => Ok((host, TransportKind::Wifi)),
            _ => bail!("exactly one of --ble or --host is required"),
        }
    }
}

fn file_name(remote: &str) -> Result<&str> {
    remote
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .with_context(|| format!("no file name in {}", remote))
}

async fn show_version(host: &str, settings: &Settings) -> Result<()> {
    let session = WifiFileTransferSession::new(host, settings)?;
    let version = session.connect().await?;
    println!("🔌 {}", session.base_url());
    println!("   板卡: {} ({})", version.board_name, version.board_id);
    println!("   MCU: {}", version.mcu_name);
    println!("   固件: {} ({})", version.version, version.build_date);
    println!("   主机名: {}", version.hostname);
    println!("   Web API: v{}", version.web_api_version);
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let settings = cli.settings();
    let (address, transport) = cli.target()?;

    if let Commands::Version = cli.command {
        if transport != TransportKind::Wifi {
            bail!("version is only available over Wifi (use --host)");
        }
        return show_version(address, &settings).await;
    }

    let manager = ConnectionManager::new(settings);
    println!("🔗 连接 {} ({})...", address, transport);
    manager
        .set_selected_peripheral(address, transport)
        .await
        .with_context(|| format!("failed to connect to {}", address))?;
    tracing::info!("Connected to {} over {}", address, transport);

    match &cli.command {
        Commands::Ls { path, json } => {
            let Some(entries) = manager.list_directory(path).await? else {
                bail!("directory not found: {}", path);
            };
            if *json {
                output::print_entries_json(&entries)?;
            } else {
                println!("📂 {}", path);
                output::print_entries(&entries);
            }
        }
        Commands::Get { remote, local } => {
            let local = match local {
                Some(local) => local.clone(),
                None => PathBuf::from(file_name(remote)?),
            };
            println!("📥 下载 {} -> {}", remote, local.display());
            let data = manager
                .read_file(remote, Some(output::progress_bar("下载")))
                .await?;
            tokio::fs::write(&local, &data)
                .await
                .with_context(|| format!("failed to write {}", local.display()))?;
            println!("✅ 已保存 {}", output::human_size(data.len() as u64));
        }
        Commands::Put { local, remote } => {
            let data = read_local(local).await?;
            println!("📤 上传 {} -> {}", local.display(), remote);
            manager
                .write_file(remote, data, Some(output::progress_bar("上传")))
                .await?;
            println!("✅ 上传完成");
        }
        Commands::Rm { path } => {
            manager.delete_file(path).await?;
            println!("🗑️  已删除 {}", path);
        }
        Commands::Mv { from, to } => {
            manager.move_file(from, to).await?;
            println!("✅ {} -> {}", from, to);
        }
        Commands::Mkdir { path } => {
            manager.make_directory(path).await?;
            println!("📁 已创建 {}", path);
        }
        // 已在连接前处理
        Commands::Version => {}
    }

    manager.disconnect_all().await;
    Ok(())
}

async fn read_local(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（ftlink-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ftlink_core=debug")),
        )
        .try_init();

    let cli = Cli::parse();
    tracing::debug!("ftlink {} starting", env!("CARGO_PKG_VERSION"));
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("/lib/neopixel.py").unwrap(), "neopixel.py");
        assert_eq!(file_name("code.py").unwrap(), "code.py");
        assert!(file_name("/").is_err());
    }

    #[test]
    fn test_target_requires_one_transport() {
        assert!(Cli::try_parse_from(["ftlink", "ls"]).is_err());
        assert!(Cli::try_parse_from(["ftlink", "--ble", "AA", "--host", "h", "ls"]).is_err());

        let cli = Cli::try_parse_from(["ftlink", "--host", "cpy.local", "ls", "/lib"]).unwrap();
        let (address, transport) = cli.target().unwrap();
        assert_eq!(address, "cpy.local");
        assert_eq!(transport, TransportKind::Wifi);
    }

    #[test]
    fn test_flags_override_settings() {
        let cli = Cli::try_parse_from([
            "ftlink",
            "--host",
            "cpy.local",
            "--port",
            "8080",
            "--password",
            "secret",
            "version",
        ])
        .unwrap();
        let settings = cli.settings();
        assert_eq!(settings.wifi_port, 8080);
        assert_eq!(settings.wifi_password.as_deref(), Some("secret"));
    }
}
