//! A `tracing_subscriber` event formatter for the demo binary's console
//! output: the whole line is colorized by level, with the file's own
//! connection/channel/ping events staying readable without timestamps or
//! target noise cluttering a terminal.

use std::fmt;

use colored::{Color, Colorize};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// One level's entry in [`LEVEL_PALETTE`]: the level it answers for and
/// the color its line should render in.
struct PaletteEntry {
    level: Level,
    color: Color,
}

/// Ordered brightest-to-dimmest so a linear scan finds `ERROR` in one
/// comparison; the common case in a healthy run is `INFO`/`DEBUG` though,
/// which still cost at most four.
const LEVEL_PALETTE: &[PaletteEntry] = &[
    PaletteEntry { level: Level::ERROR, color: Color::Red },
    PaletteEntry { level: Level::WARN, color: Color::Yellow },
    PaletteEntry { level: Level::INFO, color: Color::White },
    PaletteEntry { level: Level::DEBUG, color: Color::Blue },
    PaletteEntry { level: Level::TRACE, color: Color::Magenta },
];

fn palette_color(level: Level) -> Color {
    LEVEL_PALETTE
        .iter()
        .find(|entry| entry.level == level)
        .map(|entry| entry.color)
        .unwrap_or(Color::White)
}

/// Colorizes an entire formatted log line by its level, instead of
/// tagging just the level name the way the default formatter does.
pub struct SeverityColorFormatter;

impl<S, N> FormatEvent<S, N> for SeverityColorFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut line = String::new();
        ctx.format_fields(Writer::new(&mut line), event)?;
        let painted = line.color(palette_color(*event.metadata().level()));
        writeln!(writer, "{painted}")
    }
}
