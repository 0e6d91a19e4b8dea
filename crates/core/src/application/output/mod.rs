// Output processing: raw process bytes -> lines -> filtered log entries

mod assembler;
mod filter;

pub use assembler::LineAssembler;
pub use filter::{
    is_progress_line, parse_percentage, sanitize, strip_ansi, FilterConfig, LineDecision,
    LineFilter,
};
