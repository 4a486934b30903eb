//! Interactive driver over a [`Session`].
//! Uses dialoguer for prompts and indicatif for progress.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use console::{style, Term};
use dialoguer::{theme::ColorfulTheme, Confirm, Input, MultiSelect, Select};
use indicatif::MultiProgress;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

use crate::booru::config_loader::ConfigManager;
use crate::booru::dataset::{tag_string, TagSettings, TargetFormat};
use crate::booru::post::Post;
use crate::booru::session::Session;
use crate::booru::source::{split_query, Capabilities, PostOrder, SourceHandle, TagOrder, TagProgress};
use crate::booru::tags::Tag;
use crate::tui::{download_style, spinner_style, ProgressBarBuilder};

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Tags shown per post in result lists.
const TAG_PREVIEW: usize = 6;

/// Tags printed after a listing or search.
const TAG_LISTING: usize = 25;

/// Main menu options
#[derive(Debug, Clone, Copy)]
enum MainMenuOption {
    SearchPosts,
    Downloads,
    BrowseLibrary,
    RescanLibrary,
    ExportDataset,
    ListTags,
    SearchTags,
    Settings,
    Exit,
}

impl MainMenuOption {
    fn variants() -> &'static [MainMenuOption] {
        &[
            MainMenuOption::SearchPosts,
            MainMenuOption::Downloads,
            MainMenuOption::BrowseLibrary,
            MainMenuOption::RescanLibrary,
            MainMenuOption::ExportDataset,
            MainMenuOption::ListTags,
            MainMenuOption::SearchTags,
            MainMenuOption::Settings,
            MainMenuOption::Exit,
        ]
    }

    fn display_name(&self) -> &'static str {
        match self {
            MainMenuOption::SearchPosts => "Search posts",
            MainMenuOption::Downloads => "Show downloads",
            MainMenuOption::BrowseLibrary => "Browse library",
            MainMenuOption::RescanLibrary => "Rescan library",
            MainMenuOption::ExportDataset => "Export dataset",
            MainMenuOption::ListTags => "List all tags",
            MainMenuOption::SearchTags => "Search tags",
            MainMenuOption::Settings => "Search settings",
            MainMenuOption::Exit => "Exit",
        }
    }
}

/// A program class that handles the flow of the downloader user experience and steps of execution.
pub(crate) struct Program {
    config_manager: Arc<ConfigManager>,
    theme: ColorfulTheme,
}

impl Program {
    pub(crate) fn new(config_manager: Arc<ConfigManager>) -> Self {
        Self {
            config_manager,
            theme: ColorfulTheme::default(),
        }
    }

    /// Runs the downloader program.
    pub(crate) async fn run(&self) -> Result<()> {
        Term::stdout().set_title("booru downloader");
        trace!("Starting {} {}", NAME, VERSION);

        if !(std::io::stdin().is_terminal() && std::io::stdout().is_terminal()) {
            println!("Warning: Not running in an interactive terminal.");
            println!("Please run this program from a proper terminal/command prompt.");
            return Ok(());
        }

        let config = self.config_manager.get_app_config();
        let session = Session::from_config(config).await?;
        self.report_failed_sources(&session);
        println!(
            "{} {} posts in {}",
            style("Library:").cyan(),
            session.library_set().len(),
            session.pipeline().download_dir().display()
        );
        if session.config().library.watch {
            trace!("Watching the download directory for new files");
        }

        loop {
            let result = match self.show_main_menu()? {
                MainMenuOption::SearchPosts => self.search_posts(&session).await,
                MainMenuOption::Downloads => self.show_downloads(&session).await,
                MainMenuOption::BrowseLibrary => self.browse_library(&session),
                MainMenuOption::RescanLibrary => self.rescan_library(&session).await,
                MainMenuOption::ExportDataset => self.export_dataset(&session).await,
                MainMenuOption::ListTags => self.list_tags(&session).await,
                MainMenuOption::SearchTags => self.search_tags(&session).await,
                MainMenuOption::Settings => self.edit_settings(),
                MainMenuOption::Exit => break,
            };

            // a failed action is reported and the menu comes back
            if let Err(e) = result {
                error!("Menu action failed: {:#}", e);
                println!("{}: {:#}", style("Error").red().bold(), e);
            }
        }

        let pending = session.pipeline().queued_count();
        if pending > 0 {
            println!("{}", style(format!("Waiting for {} downloads to finish...", pending)).cyan());
        }
        session.shutdown().await;
        println!("{}", style("Exiting...").cyan());
        Ok(())
    }

    fn report_failed_sources(&self, session: &Session) {
        for (name, e) in session.failed_sources() {
            println!("{} {}: {}", style("Source failed to load").yellow(), name, e);
        }
        if session.sources().is_empty() {
            println!("{}", style("No sources are available. Check the [sources] section of config.toml.").yellow());
        }
    }

    fn show_main_menu(&self) -> Result<MainMenuOption> {
        let options = MainMenuOption::variants();
        let option_names: Vec<&str> = options.iter().map(|o| o.display_name()).collect();

        println!("\n{}", style("Booru Downloader - Main Menu").cyan().bold());
        let selection = Select::with_theme(&self.theme)
            .items(&option_names)
            .default(0)
            .interact()?;

        Ok(options[selection])
    }

    /// Lets the user pick a source that implements `capability`.
    fn choose_source(&self, session: &Session, capability: Capabilities) -> Result<Option<SourceHandle>> {
        let candidates: Vec<&SourceHandle> = session
            .sources()
            .iter()
            .filter(|source| source.supports(capability))
            .collect();
        if candidates.is_empty() {
            println!("{}", style(format!("No source supports {}.", capability)).yellow());
            return Ok(None);
        }

        let names: Vec<&str> = candidates.iter().map(|source| source.name()).collect();
        let selection = Select::with_theme(&self.theme)
            .with_prompt("Source")
            .items(&names)
            .default(0)
            .interact()?;
        Ok(Some(candidates[selection].clone()))
    }

    fn prompt_query(&self, prompt: &str) -> Result<(Vec<String>, Vec<String>)> {
        let query: String = Input::with_theme(&self.theme)
            .with_prompt(prompt)
            .allow_empty(true)
            .interact_text()?;
        let terms: Vec<&str> = query.split_whitespace().collect();
        Ok(split_query(&terms))
    }

    async fn search_posts(&self, session: &Session) -> Result<()> {
        let Some(source) = self.choose_source(session, Capabilities::SEARCH_POSTS)? else {
            return Ok(());
        };
        let (include, exclude) = self.prompt_query("Tags (prefix with - to exclude)")?;

        let page: u32 = Input::with_theme(&self.theme)
            .with_prompt("Page")
            .default(1)
            .interact_text()?;

        let search = self.config_manager.get_app_config().search;
        let default_order = search.order()?;
        let order_names: Vec<String> = PostOrder::ALL.iter().map(|order| order.to_string()).collect();
        let order_index = Select::with_theme(&self.theme)
            .with_prompt("Order")
            .items(&order_names)
            .default(PostOrder::ALL.iter().position(|o| *o == default_order).unwrap_or(0))
            .interact()?;
        let order = PostOrder::ALL[order_index];

        let posts = session
            .search(&source, page.saturating_sub(1), search.posts_per_page, order, &include, &exclude)
            .await?;
        if posts.is_empty() {
            println!("{}", style("No posts found.").yellow());
            return Ok(());
        }

        let lines: Vec<String> = posts.iter().map(describe_post).collect();
        let selected = MultiSelect::with_theme(&self.theme)
            .with_prompt("Select posts to download (Space to select, Enter to confirm)")
            .items(&lines)
            .interact()?;
        if selected.is_empty() {
            return Ok(());
        }

        let chosen: Vec<Post> = selected.into_iter().map(|index| posts[index].clone()).collect();
        let group = session.enqueue_download(Some(source.name()), &chosen)?;
        let skipped = chosen.len() - group.len();
        if skipped > 0 {
            println!(
                "{}",
                style(format!("{} posts skipped (already downloaded or no original image)", skipped)).yellow()
            );
        }
        if group.is_empty() {
            return Ok(());
        }

        if Confirm::with_theme(&self.theme)
            .with_prompt("Watch download progress?")
            .default(true)
            .interact()?
        {
            self.show_downloads(session).await?;
        }
        Ok(())
    }

    /// Draws a bar per unfinished group until all of them finish.
    async fn show_downloads(&self, session: &Session) -> Result<()> {
        let groups: Vec<_> = session
            .pipeline()
            .groups()
            .into_iter()
            .filter(|group| !group.is_complete())
            .collect();
        if groups.is_empty() {
            println!("{}", style("No downloads in progress.").green());
            return Ok(());
        }

        let multi = MultiProgress::new();
        let bars: Vec<_> = groups
            .iter()
            .map(|group| {
                let label = format!(
                    "{} {}",
                    group.source.as_deref().unwrap_or("download"),
                    group.created_at.format("%H:%M:%S")
                );
                ProgressBarBuilder::new(group.len() as u64)
                    .style(download_style())
                    .message(label)
                    .attach(&multi)
                    .build()
            })
            .collect();

        loop {
            let mut done = true;
            for (group, bar) in groups.iter().zip(&bars) {
                bar.set_position(group.progress() as u64);
                if group.is_complete() {
                    if !bar.is_finished() {
                        bar.finish();
                    }
                } else {
                    done = false;
                }
            }
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for group in &groups {
            if group.failed() > 0 {
                println!(
                    "{}",
                    style(format!("{} of {} downloads failed; see the log for details.", group.failed(), group.len()))
                        .red()
                );
            }
        }
        Ok(())
    }

    fn browse_library(&self, session: &Session) -> Result<()> {
        let (include, exclude) = self.prompt_query("Filter tags (empty shows everything)")?;
        let posts = session.filter_image_set(&include, &exclude);
        println!(
            "{}",
            style(format!("{} of {} library posts", posts.len(), session.library_set().len())).cyan()
        );
        for post in &posts {
            let path = post.media.first().map(|media| media.url.as_str()).unwrap_or("");
            println!("  {}  {}", describe_post(post), style(path).dim());
        }

        if posts.is_empty()
            || !Confirm::with_theme(&self.theme)
                .with_prompt("Print a post's tags for copying?")
                .default(false)
                .interact()?
        {
            return Ok(());
        }
        let items: Vec<String> = posts.iter().map(describe_post).collect();
        let index = Select::with_theme(&self.theme)
            .with_prompt("Post")
            .items(&items)
            .default(0)
            .interact()?;
        println!("{}", tag_string(&posts[index], &TagSettings::default()));
        Ok(())
    }

    /// Exports the visible library posts with the configured dataset
    /// settings, after asking for the destination and training folder.
    async fn export_dataset(&self, session: &Session) -> Result<()> {
        let mut settings = self.config_manager.get_app_config().dataset;
        let visible = session.library_set().visible().len();
        if visible == 0 {
            println!("{}", style("The library has no posts to export.").yellow());
            return Ok(());
        }

        let destination: String = Input::with_theme(&self.theme)
            .with_prompt("Destination directory")
            .interact_text()?;
        settings.training.keyword = Input::with_theme(&self.theme)
            .with_prompt("Keyword")
            .default(settings.training.keyword)
            .interact_text()?;
        settings.training.repetitions = Input::with_theme(&self.theme)
            .with_prompt("Repetitions")
            .default(settings.training.repetitions)
            .interact_text()?;

        let names: Vec<String> = TargetFormat::ALL.iter().map(|f| f.extension().to_string()).collect();
        let current = TargetFormat::ALL
            .iter()
            .position(|f| *f == settings.image.target_format)
            .unwrap_or(0);
        let index = Select::with_theme(&self.theme)
            .with_prompt("Image format")
            .items(&names)
            .default(current)
            .interact()?;
        settings.image.target_format = TargetFormat::ALL[index];

        let spinner = ProgressBarBuilder::spinner()
            .style(spinner_style())
            .message(format!("Exporting {} posts", visible))
            .steady_tick(Duration::from_millis(120))
            .build();
        let result = session.export_dataset(PathBuf::from(destination), settings).await;
        spinner.finish_and_clear();

        let report = result?;
        info!("Exported {} posts to {}", report.exported, report.directory.display());
        println!(
            "{}",
            style(format!("Exported {} posts to {}", report.exported, report.directory.display())).green()
        );
        if report.failed > 0 {
            println!("{}", style(format!("{} posts could not be exported.", report.failed)).yellow());
        }
        Ok(())
    }

    async fn rescan_library(&self, session: &Session) -> Result<()> {
        let posts = session.rescan_library().await?;
        println!("{}", style(format!("Library holds {} posts.", posts.len())).green());
        Ok(())
    }

    /// Pages through every tag of a source. Ctrl-C stops after the current page.
    async fn list_tags(&self, session: &Session) -> Result<()> {
        let Some(source) = self.choose_source(session, Capabilities::GET_ALL_TAGS)? else {
            return Ok(());
        };
        let order = self.choose_tag_order()?;

        let cancel = CancellationToken::new();
        let interrupt = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            })
        };

        let spinner = ProgressBarBuilder::spinner()
            .style(spinner_style())
            .message(format!("Listing tags from {} (Ctrl-C to stop)", source.name()))
            .steady_tick(Duration::from_millis(120))
            .build();
        let report = {
            let spinner = spinner.clone();
            move |tags: &[Tag]| spinner.set_message(format!("{} tags so far (Ctrl-C to stop)", tags.len()))
        };
        let progress: TagProgress<'_> = &report;

        let result = source.get_all_tags()?.get_all_tags(order, Some(progress), &cancel).await;
        interrupt.abort();
        spinner.finish_and_clear();

        let tags = result?;
        if cancel.is_cancelled() {
            println!("{}", style("Tag listing stopped early.").yellow());
        }
        info!("Listed {} tags from {}", tags.len(), source.name());
        print_tags(&tags);
        Ok(())
    }

    async fn search_tags(&self, session: &Session) -> Result<()> {
        let Some(source) = self.choose_source(session, Capabilities::SEARCH_TAGS)? else {
            return Ok(());
        };
        let prefix: String = Input::with_theme(&self.theme)
            .with_prompt("Tag prefix")
            .interact_text()?;
        let order = self.choose_tag_order()?;

        let tags = source
            .search_tags()?
            .search_tags(0, TAG_LISTING as u32, order, prefix.trim())
            .await?;
        print_tags(&tags);
        Ok(())
    }

    /// Edits the `[search]` section. Changes apply to the next search.
    fn edit_settings(&self) -> Result<()> {
        let mut config = self.config_manager.reload()?;

        config.search.posts_per_page = Input::with_theme(&self.theme)
            .with_prompt("Posts per page")
            .default(config.search.posts_per_page)
            .validate_with(|value: &u32| if *value == 0 { Err("must be at least 1") } else { Ok(()) })
            .interact_text()?;

        let current = config.search.order()?;
        let order_names: Vec<String> = PostOrder::ALL.iter().map(|order| order.to_string()).collect();
        let index = Select::with_theme(&self.theme)
            .with_prompt("Default order")
            .items(&order_names)
            .default(PostOrder::ALL.iter().position(|o| *o == current).unwrap_or(0))
            .interact()?;
        config.search.default_order = PostOrder::ALL[index].to_string();

        self.config_manager.save_app_config(&config)?;
        println!("{}", style("Settings saved.").green());
        Ok(())
    }

    fn choose_tag_order(&self) -> Result<TagOrder> {
        let names: Vec<String> = TagOrder::ALL.iter().map(|order| order.to_string()).collect();
        let index = Select::with_theme(&self.theme)
            .with_prompt("Tag order")
            .items(&names)
            .default(0)
            .interact()?;
        Ok(TagOrder::ALL[index])
    }
}

fn describe_post(post: &Post) -> String {
    let tags: Vec<&str> = post.tags.iter().take(TAG_PREVIEW).collect();
    let more = post.tags.len().saturating_sub(TAG_PREVIEW);
    let suffix = if more > 0 { format!(" +{}", more) } else { String::new() };
    format!(
        "#{} [{}] score {} {}{}",
        post.id,
        post.rating,
        post.score,
        tags.join(" "),
        suffix
    )
}

fn print_tags(tags: &[Tag]) {
    if tags.is_empty() {
        println!("{}", style("No tags found.").yellow());
        return;
    }
    println!("{}", style(format!("{} tags", tags.len())).cyan());
    for tag in tags.iter().take(TAG_LISTING) {
        println!("  {:>8}  {}", tag.count, tag.name);
    }
    if tags.len() > TAG_LISTING {
        println!("  ... and {} more", tags.len() - TAG_LISTING);
    }
}
