const RAMP: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
const EMPTY: char = '─';

pub const TOOL_SPARK_WIDTH: usize = 10;
pub const COMMAND_SPARK_WIDTH: usize = 15;

/// Bar of `width` cells for `value` relative to `max`.
///
/// The filled prefix is `⌊value/max · width⌋` cells long, every filled cell
/// drawn with the ramp glyph for `value/max`; the rest is `─`.
pub fn sparkline(value: u64, max: u64, width: usize) -> String {
    if max == 0 {
        return EMPTY.to_string().repeat(width);
    }
    let ratio = value as f64 / max as f64;
    let filled = (ratio * width as f64) as usize;
    let glyph = RAMP[((ratio * (RAMP.len() - 1) as f64) as usize).min(RAMP.len() - 1)];
    (0..width)
        .map(|i| if i < filled { glyph } else { EMPTY })
        .collect()
}
