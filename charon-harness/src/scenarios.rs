//! Acceptance scenario catalog.
//!
//! Each scenario builds a config over sandbox paths, launches the daemon,
//! writes its input files, waits for the expected number of operation
//! markers, shuts the daemon down and then checks the resulting tree.

use std::collections::BTreeSet;
use std::path::Path;

use crate::action_config::{Action, ActionConfig, WatcherConfig};
use crate::error::HarnessResult;
use crate::fixtures::{FileFixture, generate_content, generate_name};
use crate::scenario::ScenarioContext;
use crate::template::NameTemplate;

/// Files per group in the bulk scenarios.
pub const FILE_COUNT: usize = 20;

const SHORT_CONTENT: &str = "a\nb\nc";
const COUNTER_TEMPLATE: &str = "file_###";
const STALE_SEED: u64 = 999;

/// A named scenario body.
#[derive(Clone, Copy)]
pub struct ScenarioCase {
    pub name: &'static str,
    pub description: &'static str,
    pub body: fn(&mut ScenarioContext) -> HarnessResult<()>,
}

static CATALOG: [ScenarioCase; 8] = [
    ScenarioCase {
        name: "do_nothing",
        description: "empty config starts and shuts down cleanly",
        body: do_nothing,
    },
    ScenarioCase {
        name: "copy_one_file",
        description: "copy a single file with ${name}",
        body: copy_one_file,
    },
    ScenarioCase {
        name: "move_one_file",
        description: "move a single file with ${name}",
        body: move_one_file,
    },
    ScenarioCase {
        name: "multiple_files_and_actions",
        description: "copy, move and remove filtered by extension on one folder",
        body: multiple_files_and_actions,
    },
    ScenarioCase {
        name: "multiple_watchers",
        description: "two watched folders moving into one destination",
        body: multiple_watchers,
    },
    ScenarioCase {
        name: "name_counters",
        description: "two watchers share one counter sequence",
        body: name_counters,
    },
    ScenarioCase {
        name: "move_and_backup",
        description: "copy, copy, move chain linked by ${previousName}",
        body: move_and_backup,
    },
    ScenarioCase {
        name: "name_counters_non_ascii",
        description: "counter names keep non-ASCII extensions",
        body: name_counters_non_ascii,
    },
];

/// Every scenario, in execution order.
pub fn catalog() -> &'static [ScenarioCase] {
    &CATALOG
}

pub fn find(name: &str) -> Option<&'static ScenarioCase> {
    CATALOG.iter().find(|case| case.name == name)
}

/// Scenarios whose name contains any of `filters`; all of them when
/// `filters` is empty.
pub fn select(filters: &[String]) -> Vec<&'static ScenarioCase> {
    CATALOG
        .iter()
        .filter(|case| filters.is_empty() || filters.iter().any(|f| case.name.contains(f.as_str())))
        .collect()
}

fn watcher(ctx: &ScenarioContext, folder: &str) -> HarnessResult<WatcherConfig> {
    Ok(WatcherConfig::new(ctx.path(folder)?))
}

fn copy_to(ctx: &ScenarioContext, folder: &str, name: &str) -> HarnessResult<Action> {
    Ok(Action::copy(ctx.path(folder)?, name)?)
}

fn move_to(ctx: &ScenarioContext, folder: &str, name: &str) -> HarnessResult<Action> {
    Ok(Action::move_to(ctx.path(folder)?, name)?)
}

fn write_all<'a>(ctx: &ScenarioContext, files: impl IntoIterator<Item = &'a FileFixture>) -> HarnessResult<()> {
    for fixture in files {
        ctx.oracle().write_fixture(fixture)?;
    }
    Ok(())
}

/// Check that each fixture's file name exists in `dir` with its content.
fn check_files(ctx: &ScenarioContext, files: &[FileFixture], dir: &str) -> HarnessResult<()> {
    for fixture in files {
        let path = Path::new(dir).join(fixture.path.file_name().unwrap_or_default());
        ctx.check(
            ctx.oracle().validate_file(&path, &fixture.content)?,
            format!("{} holds its expected content", path.display()),
        )?;
    }
    Ok(())
}

fn check_count(ctx: &ScenarioContext, dir: &str, expected: usize) -> HarnessResult<()> {
    ctx.check_eq(ctx.oracle().file_count(dir)?, Some(expected), &format!("{dir} entry count"))
}

fn do_nothing(ctx: &mut ScenarioContext) -> HarnessResult<()> {
    ctx.launch(&ActionConfig::new())?;
    ctx.await_operations(0)?;
    ctx.shutdown()?;
    Ok(())
}

fn copy_one_file(ctx: &mut ScenarioContext) -> HarnessResult<()> {
    ctx.oracle().create_dir("Src")?;
    let config = ActionConfig::new().watcher(watcher(ctx, "Src")?.action(copy_to(ctx, "Dst", "${name}")?));
    ctx.launch(&config)?;

    ctx.oracle().write_file("Src/myFile", SHORT_CONTENT)?;
    ctx.await_operations(1)?;
    ctx.shutdown()?;

    let oracle = ctx.oracle();
    ctx.check(oracle.validate_file("Dst/myFile", SHORT_CONTENT)?, "Dst/myFile was copied")?;
    ctx.check(oracle.validate_file("Src/myFile", SHORT_CONTENT)?, "Src/myFile is untouched")?;
    check_count(ctx, "Src", 1)?;
    check_count(ctx, "Dst", 1)
}

fn move_one_file(ctx: &mut ScenarioContext) -> HarnessResult<()> {
    ctx.oracle().create_dir("Src")?;
    let config = ActionConfig::new().watcher(watcher(ctx, "Src")?.action(move_to(ctx, "Dst", "${name}")?));
    ctx.launch(&config)?;

    ctx.oracle().write_file("Src/myFile", SHORT_CONTENT)?;
    ctx.await_operations(1)?;
    ctx.shutdown()?;

    ctx.check(
        ctx.oracle().validate_file("Dst/myFile", SHORT_CONTENT)?,
        "Dst/myFile was moved",
    )?;
    check_count(ctx, "Src", 0)?;
    check_count(ctx, "Dst", 1)
}

fn seeded_files(dir: &str, suffix: &str, seed_offset: u64) -> Vec<FileFixture> {
    (0..FILE_COUNT as u64)
        .map(|i| FileFixture::from_seed(Path::new(dir).join(format!("file{i}.{suffix}")), i + seed_offset))
        .collect()
}

fn multiple_files_and_actions(ctx: &mut ScenarioContext) -> HarnessResult<()> {
    let for_copy = seeded_files("Src", "forCopy", 0);
    let for_move = seeded_files("Src", "forMove", 0);
    let for_remove = seeded_files("Src", "forRemove", 0);
    ctx.oracle().create_dir("Src")?;

    let config = ActionConfig::new()
        .watcher(
            watcher(ctx, "Src")?
                .extensions(["forCopy"])
                .action(copy_to(ctx, "Dst", "${name}")?),
        )
        .watcher(
            watcher(ctx, "Src")?
                .extensions(["forMove"])
                .action(move_to(ctx, "Dst", "${name}")?),
        )
        .watcher(
            watcher(ctx, "Src")?
                .extensions(["forRemove"])
                .action(Action::remove()),
        );
    ctx.launch(&config)?;

    write_all(ctx, for_move.iter().chain(&for_copy).chain(&for_remove))?;
    ctx.await_operations(FILE_COUNT * 3)?;
    ctx.shutdown()?;

    check_files(ctx, &for_copy, "Src")?;
    check_files(ctx, &for_copy, "Dst")?;
    check_files(ctx, &for_move, "Dst")?;
    check_count(ctx, "Src", FILE_COUNT)?;
    check_count(ctx, "Dst", FILE_COUNT * 2)
}

fn multiple_watchers(ctx: &mut ScenarioContext) -> HarnessResult<()> {
    let files1 = seeded_files("Src1", "from1", 0);
    let files2 = seeded_files("Src2", "from2", FILE_COUNT as u64);
    ctx.oracle().create_dir("Src1")?;
    ctx.oracle().create_dir("Src2")?;

    let config = ActionConfig::new()
        .watcher(watcher(ctx, "Src1")?.action(move_to(ctx, "Dst", "${name}")?))
        .watcher(watcher(ctx, "Src2")?.action(move_to(ctx, "Dst", "${name}")?));
    ctx.launch(&config)?;

    write_all(ctx, &files1)?;
    write_all(ctx, &files2)?;
    ctx.await_operations(FILE_COUNT * 2)?;
    ctx.shutdown()?;

    check_files(ctx, &files1, "Dst")?;
    check_files(ctx, &files2, "Dst")?;
    check_count(ctx, "Src1", 0)?;
    check_count(ctx, "Src2", 0)?;
    check_count(ctx, "Dst", FILE_COUNT * 2)
}

/// Counter values found in the names of `dir`'s entries.
fn counters_in(ctx: &ScenarioContext, dir: &str, template: &NameTemplate) -> HarnessResult<BTreeSet<u64>> {
    let files = ctx.oracle().list_files(dir)?.unwrap_or_default();
    Ok(files
        .iter()
        .filter_map(|path| path.file_name()?.to_str())
        .filter_map(|name| template.counter_in(name))
        .collect())
}

fn name_counters(ctx: &mut ScenarioContext) -> HarnessResult<()> {
    ctx.oracle().create_dir("Src1")?;
    ctx.oracle().create_dir("Src2")?;

    let config = ActionConfig::new()
        .watcher(watcher(ctx, "Src1")?.action(move_to(ctx, "Dst", COUNTER_TEMPLATE)?))
        .watcher(watcher(ctx, "Src2")?.action(move_to(ctx, "Dst", COUNTER_TEMPLATE)?));
    ctx.launch(&config)?;

    for i in 0..FILE_COUNT as u64 {
        ctx.oracle()
            .write_file(format!("Src1/{}.png", generate_name(i)), "")?;
    }
    for i in 0..FILE_COUNT as u64 {
        ctx.oracle()
            .write_file(format!("Src2/{}.jpg", generate_name(i + FILE_COUNT as u64)), "")?;
    }
    ctx.await_operations(FILE_COUNT * 2)?;
    ctx.shutdown()?;

    for i in 0..FILE_COUNT * 2 {
        let oracle = ctx.oracle();
        let found = oracle.validate_file(format!("Dst/file_{i:03}.jpg"), "")?
            || oracle.validate_file(format!("Dst/file_{i:03}.png"), "")?;
        ctx.check(found, format!("Dst/file_{i:03} exists as .png or .jpg"))?;
    }
    let template = NameTemplate::parse(COUNTER_TEMPLATE)?;
    let expected: BTreeSet<u64> = (0..(FILE_COUNT * 2) as u64).collect();
    ctx.check_eq(counters_in(ctx, "Dst", &template)?, expected, "counter values in Dst")?;
    check_count(ctx, "Src1", 0)?;
    check_count(ctx, "Src2", 0)?;
    check_count(ctx, "Dst", FILE_COUNT * 2)
}

fn move_and_backup(ctx: &mut ScenarioContext) -> HarnessResult<()> {
    let files: Vec<FileFixture> = (0..FILE_COUNT as u64)
        .map(|i| FileFixture::from_seed(format!("Src1/{}.csv", generate_name(i)), i))
        .collect();
    ctx.oracle().create_dir("Src1")?;

    let config = ActionConfig::new().watcher(
        watcher(ctx, "Src1")?
            .action(copy_to(ctx, "Dst1", COUNTER_TEMPLATE)?)
            .action(copy_to(ctx, "Dst2", "${previousName}")?)
            .action(move_to(ctx, "Dst3", "${previousName}")?),
    );
    ctx.launch(&config)?;

    // Stale files in the backup folders must be overwritten.
    let stale = generate_content(STALE_SEED);
    ctx.oracle().write_file("Dst2/file_003.csv", &stale)?;
    ctx.oracle().write_file("Dst3/file_004.csv", &stale)?;

    write_all(ctx, &files)?;
    ctx.await_operations(FILE_COUNT * 3)?;
    ctx.shutdown()?;

    check_count(ctx, "Src1", 0)?;
    check_count(ctx, "Dst1", FILE_COUNT)?;
    check_count(ctx, "Dst2", FILE_COUNT)?;
    check_count(ctx, "Dst3", FILE_COUNT)?;

    let oracle = ctx.oracle();
    let dst1 = oracle.list_files("Dst1")?.unwrap_or_default();
    let dst2 = oracle.list_files("Dst2")?.unwrap_or_default();
    let dst3 = oracle.list_files("Dst3")?.unwrap_or_default();
    for ((a, b), c) in dst1.iter().zip(&dst2).zip(&dst3) {
        let all_equal = oracle.files_equal(a, b)? && oracle.files_equal(a, c)? && oracle.files_equal(b, c)?;
        ctx.check(
            all_equal,
            format!("{}, {} and {} are identical", a.display(), b.display(), c.display()),
        )?;
    }
    Ok(())
}

fn name_counters_non_ascii(ctx: &mut ScenarioContext) -> HarnessResult<()> {
    let names = ["file1.ź", "file2_ą.ź", "file3_ę.ź", "file4.ź"];
    ctx.oracle().create_dir("Src")?;
    let config = ActionConfig::new().watcher(watcher(ctx, "Src")?.action(move_to(ctx, "Dst", COUNTER_TEMPLATE)?));
    ctx.launch(&config)?;

    for name in names {
        ctx.oracle().write_file(Path::new("Src").join(name), SHORT_CONTENT)?;
    }
    ctx.await_operations(names.len())?;
    ctx.shutdown()?;

    for i in 0..names.len() {
        let path = format!("Dst/file_{i:03}.ź");
        ctx.check(
            ctx.oracle().validate_file(&path, SHORT_CONTENT)?,
            format!("{path} holds the moved content"),
        )?;
    }
    check_count(ctx, "Src", 0)?;
    check_count(ctx, "Dst", names.len())
}
