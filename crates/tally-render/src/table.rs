const GAP: &str = "  ";
const BOX_MIN_INNER: usize = 64;

/// Column-aligned text table with a `─` rule under the header.
#[derive(Debug, Clone)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Short rows are padded with empty cells; extra cells are dropped.
    pub fn row(&mut self, mut cells: Vec<String>) {
        cells.resize(self.headers.len(), String::new());
        self.rows.push(cells);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn render(&self) -> String {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| width(h)).collect();
        for row in &self.rows {
            for (w, cell) in widths.iter_mut().zip(row) {
                *w = (*w).max(width(cell));
            }
        }

        let rule: Vec<String> = self.headers.iter().map(|h| "─".repeat(width(h))).collect();
        let mut out = String::new();
        write_line(&mut out, &self.headers, &widths);
        write_line(&mut out, &rule, &widths);
        for row in &self.rows {
            write_line(&mut out, row, &widths);
        }
        out
    }
}

fn write_line(out: &mut String, cells: &[String], widths: &[usize]) {
    let mut line = String::new();
    for (i, (cell, w)) in cells.iter().zip(widths).enumerate() {
        if i > 0 {
            line.push_str(GAP);
        }
        line.push_str(cell);
        line.extend(std::iter::repeat(' ').take(w.saturating_sub(width(cell))));
    }
    out.push_str(line.trim_end());
    out.push('\n');
}

fn width(s: &str) -> usize {
    s.chars().count()
}

/// Centered title inside a double-line box, followed by a blank line.
pub(crate) fn boxed(out: &mut String, title: &str) {
    let inner = BOX_MIN_INNER.max(width(title) + 4);
    let left = (inner - width(title)) / 2;
    let right = inner - width(title) - left;
    out.push_str(&format!("╔{}╗\n", "═".repeat(inner)));
    out.push_str(&format!("║{}{title}{}║\n", " ".repeat(left), " ".repeat(right)));
    out.push_str(&format!("╚{}╝\n\n", "═".repeat(inner)));
}

/// Section title underlined with `─`.
pub(crate) fn section(out: &mut String, title: &str) {
    out.push_str(title);
    out.push('\n');
    out.push_str(&"─".repeat(width(title)));
    out.push('\n');
}

/// `Label:  value` lines with the values aligned, then a blank line.
pub(crate) fn key_values(out: &mut String, pairs: &[(&str, String)]) {
    let label_width = pairs.iter().map(|(k, _)| width(k) + 1).max().unwrap_or(0);
    for (key, value) in pairs {
        let label = format!("{key}:");
        out.push_str(&format!("{label:<label_width$}{GAP}{value}\n"));
    }
    out.push('\n');
}
