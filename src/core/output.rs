//! Compact output rendering helpers for CLI surfaces.

/// Fit `input` on one terminal line of at most `width` characters.
///
/// Runs of whitespace become single spaces. Longer text keeps its beginning
/// and end around a `..` marker, so both a command's program and the tail of
/// a long path stay visible.
pub fn fit_cell(input: &str, width: usize) -> String {
    let flat: Vec<char> = input.split_whitespace().collect::<Vec<_>>().join(" ").chars().collect();
    if flat.len() <= width {
        return flat.into_iter().collect();
    }
    if width < 5 {
        return flat[..width].iter().collect();
    }
    let tail = (width - 2) / 2;
    let head = width - 2 - tail;
    let mut out: String = flat[..head].iter().collect();
    out.push_str("..");
    out.extend(&flat[flat.len() - tail..]);
    out
}

/// Byte count with a binary unit suffix, e.g. `1.5KiB`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{}B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1}{}", value, UNITS[unit])
}

/// Left-aligned plain-text table. Cells wider than `max_cell` are compacted.
pub fn render_table(headers: &[&str], rows: &[Vec<String>], max_cell: usize) -> String {
    let rows: Vec<Vec<String>> = rows
        .iter()
        .map(|row| row.iter().map(|cell| fit_cell(cell, max_cell)).collect())
        .collect();
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in &rows {
        for (idx, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(idx) {
                *width = (*width).max(cell.chars().count());
            }
        }
    }
    let dashes: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    let mut out = vec![pad_row(headers, &widths)];
    out.push(pad_row(&dashes.iter().map(String::as_str).collect::<Vec<_>>(), &widths));
    for row in &rows {
        out.push(pad_row(&row.iter().map(String::as_str).collect::<Vec<_>>(), &widths));
    }
    out.join("\n")
}

fn pad_row(cells: &[&str], widths: &[usize]) -> String {
    cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
        .collect::<Vec<_>>()
        .join("  ")
        .trim_end()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_cell_keeps_both_ends() {
        assert_eq!(fit_cell("a  b\nc", 10), "a b c");
        assert_eq!(fit_cell("/home/user/project/bin/a.out", 12), "/home..a.out");
        assert_eq!(fit_cell("abcdef", 3), "abc");
        assert_eq!(fit_cell("abcdefgh", 8), "abcdefgh");
    }

    #[test]
    fn human_size_units() {
        assert_eq!(human_size(512), "512B");
        assert_eq!(human_size(1536), "1.5KiB");
        assert_eq!(human_size(3 * 1024 * 1024), "3.0MiB");
    }

    #[test]
    fn table_columns_align() {
        let table = render_table(
            &["Name", "Trials"],
            &[vec!["e1".into(), "2".into()], vec!["longer".into(), "10".into()]],
            40,
        );
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "Name    Trials");
        assert_eq!(lines[1], "------  ------");
        assert_eq!(lines[3], "longer  10");
    }
}
