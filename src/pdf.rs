//! Minimal PDF 1.4 writer for results reports.
//!
//! Only the two standard Helvetica faces are used, so no fonts are embedded.
//! Text outside printable ASCII is written as `?`.

use crate::calc::{GradedMark, RankedResult};
use crate::report::{ClassGroup, ResultsReport};

// A4 landscape, in points.
const PAGE_WIDTH: f32 = 842.0;
const PAGE_HEIGHT: f32 = 595.0;
const MARGIN: f32 = 36.0;
const ROW_HEIGHT: f32 = 14.0;
const FOOTER_Y: f32 = 20.0;
const NAME_MAX_CHARS: usize = 34;

const COLUMNS: [(&str, f32); 10] = [
    ("Pos", 36.0),
    ("Name", 66.0),
    ("Math", 246.0),
    ("Eng", 312.0),
    ("Kis", 378.0),
    ("Sci", 444.0),
    ("SST", 510.0),
    ("Total", 590.0),
    ("Average", 650.0),
    ("Grade", 730.0),
];

#[derive(Clone, Copy)]
enum Font {
    Regular,
    Bold,
}

impl Font {
    fn resource(self) -> &'static str {
        match self {
            Font::Regular => "F1",
            Font::Bold => "F2",
        }
    }
}

fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' | '(' | ')' => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_ascii() && !c.is_ascii_control() => out.push(c),
            _ => out.push('?'),
        }
    }
    out
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

fn graded(m: &GradedMark) -> String {
    format!("{} {}", m.marks, m.grade)
}

struct Layout<'a> {
    report: &'a ResultsReport,
    pages: Vec<String>,
    current: String,
    y: f32,
}

impl<'a> Layout<'a> {
    fn new(report: &'a ResultsReport) -> Self {
        let mut layout = Self {
            report,
            pages: Vec::new(),
            current: String::new(),
            y: PAGE_HEIGHT - MARGIN,
        };
        layout.start_page();
        layout
    }

    fn text(&mut self, font: Font, size: f32, x: f32, y: f32, s: &str) {
        self.current.push_str(&format!(
            "BT /{} {} Tf {:.2} {:.2} Td ({}) Tj ET\n",
            font.resource(),
            size,
            x,
            y,
            escape_text(s)
        ));
    }

    fn rule(&mut self, y: f32) {
        self.current.push_str(&format!(
            "0.5 w {:.2} {:.2} m {:.2} {:.2} l S\n",
            MARGIN,
            y,
            PAGE_WIDTH - MARGIN,
            y
        ));
    }

    fn start_page(&mut self) {
        if !self.current.is_empty() {
            let done = std::mem::take(&mut self.current);
            self.pages.push(done);
        }
        self.y = PAGE_HEIGHT - MARGIN - 14.0;
        let title = self.report.title.clone();
        self.text(Font::Bold, 14.0, MARGIN, self.y, &title);
        self.y -= 18.0;
        if let Some(school) = self.report.school_name.clone() {
            self.text(Font::Regular, 10.0, MARGIN, self.y, &school);
            self.y -= 14.0;
        }
        self.y -= 6.0;
    }

    fn remaining_rows(&self) -> usize {
        let usable = self.y - (FOOTER_Y + ROW_HEIGHT);
        if usable <= 0.0 {
            0
        } else {
            (usable / ROW_HEIGHT) as usize
        }
    }

    fn group_heading(&mut self, group: &ClassGroup, continued: bool) {
        let heading = format!(
            "Class: {}{}   ({} students, class average {:.2})",
            group.class_name,
            if continued { " (cont.)" } else { "" },
            group.student_count,
            group.class_average
        );
        self.text(Font::Bold, 11.0, MARGIN, self.y, &heading);
        self.y -= ROW_HEIGHT + 2.0;
        for (label, x) in COLUMNS {
            self.text(Font::Bold, 9.0, x, self.y, label);
        }
        self.rule(self.y - 4.0);
        self.y -= ROW_HEIGHT;
    }

    fn result_row(&mut self, r: &RankedResult) {
        let cells = [
            r.position.to_string(),
            truncate_chars(&r.student_name, NAME_MAX_CHARS),
            graded(&r.math),
            graded(&r.english),
            graded(&r.kiswahili),
            graded(&r.science),
            graded(&r.sst),
            r.total_marks.to_string(),
            format!("{:.2}", r.average),
            r.avg_grade.to_string(),
        ];
        for ((_, x), cell) in COLUMNS.iter().zip(cells.iter()) {
            self.text(Font::Regular, 9.0, *x, self.y, cell);
        }
        self.y -= ROW_HEIGHT;
    }

    fn render(mut self) -> Vec<String> {
        let report = self.report;
        if report.class_groups.is_empty() {
            self.text(Font::Regular, 10.0, MARGIN, self.y, "No results to report.");
        }
        for group in &report.class_groups {
            // Heading, column header and at least one row stay together.
            if self.remaining_rows() < 3 {
                self.start_page();
            }
            self.group_heading(group, false);
            for r in &group.results {
                if self.remaining_rows() < 1 {
                    self.start_page();
                    self.group_heading(group, true);
                }
                self.result_row(r);
            }
            self.y -= ROW_HEIGHT / 2.0;
        }
        let last = std::mem::take(&mut self.current);
        self.pages.push(last);

        let total = self.pages.len();
        let mut pages = self.pages;
        for (i, page) in pages.iter_mut().enumerate() {
            let mut footer = format!("Page {} of {}", i + 1, total);
            if report.show_generated_at {
                footer = format!("Generated {}    {}", report.generated_at, footer);
            }
            page.push_str(&format!(
                "BT /F1 8 Tf {:.2} {:.2} Td ({}) Tj ET\n",
                MARGIN,
                FOOTER_Y,
                escape_text(&footer)
            ));
        }
        pages
    }
}

/// Renders the report as a complete PDF document.
pub fn render_results_pdf(report: &ResultsReport) -> Vec<u8> {
    let page_streams = Layout::new(report).render();

    // 1 catalog, 2 page tree, 3/4 fonts, then a (page, contents) pair per page.
    let mut objects: Vec<String> = Vec::new();
    let kids = (0..page_streams.len())
        .map(|i| format!("{} 0 R", 5 + 2 * i))
        .collect::<Vec<_>>()
        .join(" ");
    objects.push("<< /Type /Catalog /Pages 2 0 R >>".to_string());
    objects.push(format!(
        "<< /Type /Pages /Kids [{}] /Count {} >>",
        kids,
        page_streams.len()
    ));
    objects.push(
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica /Encoding /WinAnsiEncoding >>"
            .to_string(),
    );
    objects.push(
        "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica-Bold /Encoding /WinAnsiEncoding >>"
            .to_string(),
    );
    for (i, stream) in page_streams.iter().enumerate() {
        objects.push(format!(
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {} {}] \
             /Resources << /Font << /F1 3 0 R /F2 4 0 R >> >> /Contents {} 0 R >>",
            PAGE_WIDTH,
            PAGE_HEIGHT,
            6 + 2 * i
        ));
        objects.push(format!(
            "<< /Length {} >>\nstream\n{}endstream",
            stream.len(),
            stream
        ));
    }

    let mut out: Vec<u8> = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let mut offsets: Vec<usize> = Vec::with_capacity(objects.len());
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", i + 1, body).as_bytes());
    }

    let xref_offset = out.len();
    let mut xref = format!("xref\n0 {}\n0000000000 65535 f \n", objects.len() + 1);
    for off in &offsets {
        xref.push_str(&format!("{:010} 00000 n \n", off));
    }
    out.extend_from_slice(xref.as_bytes());
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref_offset
        )
        .as_bytes(),
    );
    out
}
