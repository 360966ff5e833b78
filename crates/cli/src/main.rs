use clap::{Args, Parser, Subcommand};
use std::io::{self, BufRead, Write as _};
use std::path::{Path, PathBuf};
use thiserror::Error;
use writer_adapters::{create_llm_adapter, AdapterError, LanguageModel, LanguageModelError};
use writer_core::{
    ConfigStore, LogLevel, LogRecord, LogSink, PromptError, PromptRegistry, SessionError,
    StdoutLogSink, Turn, UserBrief, WritingSession,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let sink = StdoutLogSink::new();

    match cli.command {
        Command::Config(command) => handle_config(&cli.config, command, &sink),
        Command::Session(command) => handle_session(&cli.config, command, &sink),
    }
}

fn handle_config(
    config_path: &Path,
    command: ConfigCommand,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    match command {
        ConfigCommand::TestLlm(args) => run_test_llm(config_path, args, sink),
    }
}

fn handle_session(
    config_path: &Path,
    command: SessionCommand,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    match command {
        SessionCommand::Run(args) => run_session(config_path, args, sink),
    }
}

fn run_test_llm(config_path: &Path, args: TestLlmArgs, sink: &dyn LogSink) -> Result<(), CliError> {
    let mut store = ConfigStore::open(config_path.to_path_buf())?;
    store.ensure_recent_defaults();

    let selected = select_llm_interface(&store, args.interface)?;

    let profile = store
        .config()
        .get_llm_profile(&selected)
        .cloned()
        .ok_or_else(|| CliError::UnknownInterface(selected.clone()))?;

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("开始测试 LLM 配置：{selected}"),
    ));
    sink.log(LogRecord::new(
        LogLevel::Debug,
        format!(
            "模型: {} | 接口模式: {} | Base URL: {}",
            profile.model_name, profile.interface_format, profile.base_url
        ),
    ));

    let adapter = create_llm_adapter(store.config(), &selected)?;
    sink.log(LogRecord::new(
        LogLevel::Info,
        "发送测试提示词: Please reply 'OK'".to_string(),
    ));

    match adapter.invoke("Please reply 'OK'") {
        Ok(response) => {
            if response.trim().is_empty() {
                sink.log(LogRecord::new(
                    LogLevel::Error,
                    "❌ LLM配置测试失败：未获取到响应".to_string(),
                ));
                return Err(CliError::TestFailed(
                    "LLM配置测试失败：未获取到响应".to_string(),
                ));
            }

            sink.log(LogRecord::new(
                LogLevel::Info,
                "✅ LLM配置测试成功！".to_string(),
            ));
            sink.log(LogRecord::new(
                LogLevel::Debug,
                format!("测试回复: {response}"),
            ));
        }
        Err(err) => {
            sink.log(LogRecord::new(
                LogLevel::Error,
                format!("❌ LLM配置测试出错: {err}"),
            ));
            return Err(CliError::Model(err));
        }
    }

    store.touch_llm_interface(selected);
    store.save()?;

    Ok(())
}

fn run_session(
    config_path: &Path,
    args: SessionRunArgs,
    sink: &dyn LogSink,
) -> Result<(), CliError> {
    let mut store = ConfigStore::open(config_path.to_path_buf())?;
    store.ensure_recent_defaults();

    let defaults = store.config().session.clone();
    let title = resolve_field(args.title, &defaults.title, "title")?;
    let idea = resolve_field(args.idea, &defaults.idea, "idea")?;
    let chapter_count = args.chapters.unwrap_or(defaults.chapter_count);
    if chapter_count == 0 {
        return Err(CliError::InvalidChapterCount);
    }

    let selected_llm = select_llm_interface(&store, args.llm_interface.clone())?;
    let prompts = PromptRegistry::from_prompt_config(&store.config().prompts)?;
    let adapter = create_llm_adapter(store.config(), &selected_llm)?;

    sink.log(LogRecord::new(
        LogLevel::Info,
        format!("使用 LLM 接口：{selected_llm}"),
    ));

    let brief = UserBrief::new(title, idea, chapter_count);
    let mut session = WritingSession::new(&prompts, sink, brief)
        .with_preview_chars(args.preview.unwrap_or(defaults.preview_chars));

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut turn = session.start(adapter.as_ref())?;

    loop {
        turn = match turn {
            Turn::AwaitingReview {
                chapter_number,
                preview,
            } => {
                println!("\n当前章节内容（第{chapter_number}章）：\n{preview}...\n");
                println!("请选择操作：");
                println!("1. 输入 accept：接受此章节内容，进入下一章节；");
                println!("2. 输入 revise：重新生成当前章节内容；");
                println!("3. 输入 outline：修改大纲；");
                println!("4. 或直接输入具体修改建议。");
                let input = read_line(&mut lines)?;
                session.resume_review(adapter.as_ref(), &input)?
            }
            Turn::AwaitingOutlineNote => {
                println!("\n请输入对大纲的调整建议：");
                let note = read_line(&mut lines)?;
                session.resume_outline_note(adapter.as_ref(), &note)?
            }
            Turn::Finished(chapters) => {
                println!("\n全部章节已完成（共{}章）。", chapters.len());
                for chapter in &chapters {
                    println!("\n===== 第{}章 {} =====", chapter.number, chapter.name);
                    println!("{}", chapter.text);
                }
                break;
            }
        };
    }

    store.touch_llm_interface(selected_llm);
    store.save()?;

    Ok(())
}

fn read_line(lines: &mut impl Iterator<Item = io::Result<String>>) -> Result<String, CliError> {
    print!("> ");
    io::stdout().flush().map_err(CliError::Stdin)?;
    match lines.next() {
        Some(Ok(line)) => Ok(line),
        Some(Err(source)) => Err(CliError::Stdin(source)),
        None => Err(CliError::InputClosed),
    }
}

fn resolve_field(
    argument: Option<String>,
    configured: &str,
    field: &'static str,
) -> Result<String, CliError> {
    let value = argument.unwrap_or_else(|| configured.to_string());
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(CliError::MissingBriefField { field })
    } else {
        Ok(trimmed.to_string())
    }
}

fn select_llm_interface(
    store: &ConfigStore,
    preferred: Option<String>,
) -> Result<String, CliError> {
    if let Some(name) = normalize_preference(preferred) {
        if store.config().llm_profiles.contains_key(&name) {
            return Ok(name);
        }
        return Err(CliError::UnknownInterface(name));
    }

    if let Some(name) = store.last_llm_interface() {
        return Ok(name.to_string());
    }

    if let Some(name) = store.config().llm_profiles.keys().next() {
        return Ok(name.clone());
    }

    Err(CliError::MissingLlmProfile)
}

fn normalize_preference(value: Option<String>) -> Option<String> {
    value.and_then(|raw| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[derive(Debug, Error)]
enum CliError {
    #[error("配置文件错误: {0}")]
    Config(#[from] writer_core::ConfigError),
    #[error("缺少可用的 LLM 配置，无法执行该操作。")]
    MissingLlmProfile,
    #[error("未找到名为 `{0}` 的接口配置")]
    UnknownInterface(String),
    #[error("会话参数 `{field}` 不能为空，请通过命令行或 config.json 提供。")]
    MissingBriefField { field: &'static str },
    #[error("章节数必须大于 0。")]
    InvalidChapterCount,
    #[error("读取输入失败: {0}")]
    Stdin(io::Error),
    #[error("输入流已关闭，会话中止。")]
    InputClosed,
    #[error("适配器调用失败: {0}")]
    Adapter(#[from] AdapterError),
    #[error("LLM 调用失败: {0}")]
    Model(#[from] LanguageModelError),
    #[error("提示词加载失败: {0}")]
    Prompt(#[from] PromptError),
    #[error("会话执行失败: {0}")]
    Session(#[from] SessionError),
    #[error("{0}")]
    TestFailed(String),
}

#[derive(Parser)]
#[command(
    name = "writerctl",
    version,
    about = "互动式小说写作命令行工具：大纲、章节与人工审阅"
)]
struct Cli {
    /// 指定配置文件路径
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 配置相关操作
    #[command(subcommand)]
    Config(ConfigCommand),
    /// 写作会话相关操作
    #[command(subcommand)]
    Session(SessionCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// 测试当前 LLM 接口配置
    TestLlm(TestLlmArgs),
}

#[derive(Subcommand)]
enum SessionCommand {
    /// 启动一次大纲-章节-审阅写作会话
    Run(SessionRunArgs),
}

#[derive(Args)]
struct TestLlmArgs {
    /// 指定要测试的接口名称，默认为最近使用的接口
    #[arg(long)]
    interface: Option<String>,
}

#[derive(Args)]
struct SessionRunArgs {
    /// 小说标题，缺省时取 config.json 中的 session.title
    #[arg(long, value_name = "TEXT")]
    title: Option<String>,
    /// 小说构思，缺省时取 config.json 中的 session.idea
    #[arg(long, value_name = "TEXT")]
    idea: Option<String>,
    /// 计划章节数，缺省时取 config.json 中的 session.chapter_count
    #[arg(long, value_name = "N")]
    chapters: Option<u32>,
    /// 指定会话使用的 LLM 接口名称
    #[arg(long)]
    llm_interface: Option<String>,
    /// 审阅时展示的章节预览字符数
    #[arg(long, value_name = "N")]
    preview: Option<usize>,
}
