use anyhow::Result;
use clap::{Parser, Subcommand};
use xshell::{Shell, cmd};

#[derive(Parser)]
#[command(name = "xtask", about = "ftlink 开发任务自动化")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 构建所有组件 (release)
    Build,
    /// 运行测试
    Test,
    /// 运行 clippy 检查
    Clippy,
    /// 运行测试并生成覆盖率报告
    Coverage,
    /// 打包发布 (tar.gz)
    Dist,
    /// 清理构建产物
    Clean,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    // 确保在项目根目录执行
    let project_root = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => std::path::PathBuf::from(dir)
            .parent()
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(|| std::path::PathBuf::from(".")),
        Err(_) => std::env::current_dir()?,
    };
    sh.change_dir(&project_root);

    match cli.command {
        Commands::Build => build(&sh)?,
        Commands::Test => test(&sh)?,
        Commands::Clippy => clippy(&sh)?,
        Commands::Coverage => coverage(&sh)?,
        Commands::Dist => dist(&sh)?,
        Commands::Clean => clean(&sh)?,
    }

    Ok(())
}

fn build(sh: &Shell) -> Result<()> {
    println!("🔨 构建所有组件...");
    cmd!(sh, "cargo build --release -p ftlink-core -p ftlink-cli").run()?;
    println!("✅ 构建完成");
    Ok(())
}

fn test(sh: &Shell) -> Result<()> {
    println!("🧪 运行测试...");
    cmd!(sh, "cargo test --workspace").run()?;
    println!("✅ 测试完成");
    Ok(())
}

fn clippy(sh: &Shell) -> Result<()> {
    println!("📎 运行 clippy...");
    cmd!(sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;
    println!("✅ 检查通过");
    Ok(())
}

/// 覆盖率报告输出目录
const COVERAGE_DIR: &str = "target/coverage";

/// tarpaulin 参数：库和 CLI 都统计，输出 HTML 和 lcov (供编辑器插件使用)
fn tarpaulin_args() -> Vec<String> {
    [
        "tarpaulin",
        "--packages",
        "ftlink-core",
        "--packages",
        "ftlink-cli",
        "--out",
        "Html",
        "--out",
        "Lcov",
        "--output-dir",
        COVERAGE_DIR,
    ]
    .map(String::from)
    .to_vec()
}

fn coverage(sh: &Shell) -> Result<()> {
    if cmd!(sh, "cargo tarpaulin --version").quiet().read().is_err() {
        println!("📦 未找到 cargo-tarpaulin，正在安装...");
        cmd!(sh, "cargo install cargo-tarpaulin").run()?;
    }

    println!("📊 统计 ftlink-core / ftlink-cli 覆盖率...");
    let args = tarpaulin_args();
    cmd!(sh, "cargo {args...}").run()?;

    println!("✅ 报告位于 {}/", COVERAGE_DIR);
    println!("   tarpaulin-report.html / lcov.info");
    Ok(())
}

fn dist(sh: &Shell) -> Result<()> {
    println!("📦 打包发布...");

    build(sh)?;

    let version = env!("CARGO_PKG_VERSION");
    let dist_name = format!("ftlink-{}-linux-x86_64", version);

    cmd!(sh, "mkdir -p dist/{dist_name}").run()?;
    cmd!(sh, "cp target/release/ftlink dist/{dist_name}/").run()?;
    if sh.path_exists("README.md") {
        cmd!(sh, "cp README.md dist/{dist_name}/").run()?;
    }

    sh.change_dir("dist");
    cmd!(sh, "tar -czvf {dist_name}.tar.gz {dist_name}").run()?;

    println!("✅ 打包完成: dist/{}.tar.gz", dist_name);
    Ok(())
}

fn clean(sh: &Shell) -> Result<()> {
    println!("🧹 清理 target/ 和 dist/...");
    cmd!(sh, "cargo clean").run()?;
    sh.remove_path("dist")?;
    println!("✅ 清理完成");
    Ok(())
}
