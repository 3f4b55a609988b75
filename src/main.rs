//! chunk-downloader 命令行入口。
//!
//! 单个任务：解析链接 → 后台线程分块下载 → 终端进度条。Ctrl-C 暂停并保留已下载部分，
//! 之后用同样的参数加 `--current-size` 重新运行即可续传。

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use tracing::{info, warn};

use chunk_downloader::base_system::config::{load_or_create, load_or_create_with_base};
use chunk_downloader::base_system::context::{Config, file_name_from_remote};
use chunk_downloader::base_system::logging::{LogOptions, LogSystem};
use chunk_downloader::download::progress::{self, ProgressView};
use chunk_downloader::third_party::link_resolver::{LinkResolver, build_resolver};
use chunk_downloader::{
    DownloadEvent, Downloader, EventFilter, EventPublisher, TaskRecord, TaskState,
};

#[derive(Debug, Parser)]
#[command(name = "chunk-downloader", version)]
#[command(about = "Resumable chunked HTTP downloader")]
struct Cli {
    /// 远端路径（meta_api 模式）或下载地址（direct 模式）
    remote: String,

    /// 保存文件名，默认取远端路径最后一段
    #[arg(long)]
    name: Option<String>,

    /// 保存目录，默认使用配置中的 save_path
    #[arg(long)]
    dir: Option<PathBuf>,

    /// 文件总大小（字节），不指定时向服务端查询
    #[arg(long)]
    size: Option<u64>,

    /// 上次记录的已下载字节数，用于续传
    #[arg(long, default_value_t = 0)]
    current_size: u64,

    /// 任务标识，默认随机生成
    #[arg(long)]
    id: Option<String>,

    /// 配置文件路径
    #[arg(long)]
    config: Option<PathBuf>,

    /// 数据目录（存放 config.yml 和 logs）
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// 不显示进度条
    #[arg(long, default_value_t = false)]
    quiet: bool,

    /// 以 JSON 行输出下载事件（替代进度条）
    #[arg(long, default_value_t = false)]
    json: bool,

    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.as_deref();
    let log = init_logging(cli.debug, data_dir)?;

    let config = load_config(cli.config.as_deref(), data_dir)?;
    let fetch_settings = config.fetch_settings();
    let resolver = build_resolver(config.resolver, &config.meta_api_endpoint, &fetch_settings)
        .context("初始化链接解析器失败")?;

    let total_size = match cli.size {
        Some(size) => size,
        None => probe_size(resolver.as_ref(), &cli.remote)?,
    };
    let save_dir = cli.dir.clone().unwrap_or_else(|| config.default_save_dir());
    let save_name = cli
        .name
        .clone()
        .unwrap_or_else(|| file_name_from_remote(&cli.remote));
    let id = cli
        .id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let record = TaskRecord::new(&id, &cli.remote, save_dir, save_name, total_size)
        .with_current_size(cli.current_size);
    let save_path = record.save_path();
    info!(target: "startup", id = %id, path = %save_path.display(), total_size, "创建任务");

    let events = EventPublisher::new(config.event_buffer);
    let subscription = events.subscribe(EventFilter::for_task(&id));

    let downloader = Downloader::with_http(
        record,
        &fetch_settings,
        resolver,
        events.clone(),
        config.worker_settings(),
    )
    .context("创建 HTTP 客户端失败")?;
    let (handle, join) = downloader.spawn().context("启动下载线程失败")?;

    {
        let handle = handle.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            handle.pause();
        }) {
            warn!(target: "startup", "注册 Ctrl-C 处理失败: {}", err);
        }
    }
    {
        let handle = handle.clone();
        log.add_exit_hook(move || {
            handle.pause();
        });
    }

    let terminal = if cli.json {
        progress::follow_with(&subscription, &handle, |event| {
            println!("{}", progress::event_json(event));
            event.is_terminal()
        })
    } else {
        let view = if cli.quiet {
            ProgressView::hidden(total_size, cli.current_size)
        } else {
            ProgressView::new(&shorten(&save_path), total_size, cli.current_size)
        };
        progress::follow(&subscription, &view, &handle)
    };

    let record = join
        .join()
        .map_err(|_| anyhow!("下载线程异常退出"))?;

    match record.state {
        TaskState::Finished => {
            println!("已保存到 {}", save_path.display());
            Ok(())
        }
        TaskState::Paused => {
            println!(
                "已暂停：{}/{} 字节。继续下载请追加参数 --current-size {}",
                record.current_size, record.total_size, record.current_size
            );
            Ok(())
        }
        TaskState::Canceled => {
            println!("任务已取消");
            Ok(())
        }
        TaskState::Errored => {
            let reason = match terminal {
                Some(DownloadEvent::DiskError { .. }) => "本地写入失败",
                Some(DownloadEvent::NetworkError { .. }) => "网络请求失败",
                _ => "下载失败",
            };
            bail!(
                "{}（已下载 {}/{} 字节，详见 {}）",
                reason,
                record.current_size,
                record.total_size,
                log.logs_dir().join("latest.log").display()
            )
        }
        TaskState::Downloading => bail!("下载线程在下载状态下退出"),
    }
}

fn init_logging(debug: bool, base_dir: Option<&Path>) -> Result<LogSystem> {
    let logs_dir = base_dir
        .map(|dir| dir.join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let opts = LogOptions {
        debug,
        use_color: true,
        // 控制台被进度条占用，只有调试时输出日志
        console: debug,
        logs_dir,
    };
    LogSystem::init(opts).map_err(|e| anyhow!(e))
}

fn load_config(path: Option<&Path>, data_dir: Option<&Path>) -> Result<Config> {
    let config = match (path, data_dir) {
        (Some(path), _) => load_or_create::<Config>(Some(path)),
        (None, Some(dir)) => load_or_create_with_base::<Config>(None, Some(dir)),
        (None, None) => load_or_create::<Config>(None),
    };
    config.map_err(|e| anyhow!(e.to_string()))
}

fn probe_size(resolver: &dyn LinkResolver, remote: &str) -> Result<u64> {
    let meta = resolver
        .resolve_metadata(remote)
        .with_context(|| format!("查询 {remote} 的元数据失败"))?;
    meta.size
        .ok_or_else(|| anyhow!("服务端没有返回文件大小，请使用 --size 指定"))
}

fn shorten(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
