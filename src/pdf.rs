use crate::models::{LessonSummary, StepRecord};
use printpdf::*;
use std::io::BufWriter;

const LINE_CHARS: usize = 90;

/// Text-only handout: a cover page, then one page per step. Images are referenced by URL.
pub fn generate_pdf(lesson: &LessonSummary, steps: &[StepRecord]) -> Result<Vec<u8>, printpdf::Error> {
    let (doc, cover, layer) = PdfDocument::new(
        format!("Lesson: {}", truncate(&lesson.lesson_name, 48)),
        Mm(210.0),
        Mm(297.0),
        "Layer 1",
    );
    let font = doc.add_builtin_font(BuiltinFont::Helvetica)?;
    let bold = doc.add_builtin_font(BuiltinFont::HelveticaBold)?;

    let summary = doc.get_page(cover).get_layer(layer);
    summary.use_text(truncate(&lesson.lesson_name, 60), 20.0, Mm(15.0), Mm(275.0), &bold);
    summary.use_text(format!("Level: {}", truncate(&lesson.lesson_level, 80)), 11.0, Mm(15.0), Mm(262.0), &font);
    summary.use_text(format!("{} steps", steps.len()), 11.0, Mm(15.0), Mm(254.0), &font);
    let mut y = 240.0;
    for line in wrap(&lesson.lesson_description, LINE_CHARS).into_iter().take(20) {
        summary.use_text(line, 10.0, Mm(15.0), Mm(y), &font);
        y -= 6.0;
    }

    for step in steps {
        let (page, layer) = doc.add_page(Mm(210.0), Mm(297.0), format!("Step {}", step.step_number));
        let layer_ref = doc.get_page(page).get_layer(layer);
        layer_ref.use_text(format!("Step {}", step.step_number), 16.0, Mm(15.0), Mm(275.0), &bold);
        let mut y = 260.0;
        for line in wrap(&step.step_description, LINE_CHARS).into_iter().take(30) {
            layer_ref.use_text(line, 11.0, Mm(15.0), Mm(y), &font);
            y -= 6.5;
        }
        let image = step.image_ref.as_deref().unwrap_or("(no image generated)");
        layer_ref.use_text(format!("Image: {}", truncate(image, 120)), 8.0, Mm(15.0), Mm(20.0), &font);
    }

    let mut buf: Vec<u8> = Vec::new();
    {
        let mut writer = BufWriter::new(&mut buf);
        doc.save(&mut writer)?;
    }
    Ok(buf)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max { s.to_string() } else { format!("{}…", s.chars().take(max).collect::<String>()) }
}

fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    for paragraph in text.lines() {
        let mut line = String::new();
        for word in paragraph.split_whitespace() {
            if !line.is_empty() && line.chars().count() + 1 + word.chars().count() > width {
                lines.push(std::mem::take(&mut line));
            }
            if !line.is_empty() {
                line.push(' ');
            }
            line.push_str(word);
        }
        lines.push(line);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn wraps_on_word_boundaries() {
        let lines = wrap("Subtract three from both sides of the equation", 20);
        assert_eq!(lines, vec!["Subtract three from", "both sides of the", "equation"]);
        assert!(lines.iter().all(|l| l.chars().count() <= 20));
    }

    #[test]
    fn renders_a_pdf_document() {
        let lesson = LessonSummary {
            lesson_id: 1,
            created_at: Utc::now(),
            lesson_name: "Linear equations".into(),
            lesson_description: "basic algebraic operations".into(),
            lesson_level: "high school student".into(),
        };
        let steps = vec![
            StepRecord { step_number: 1, step_description: "Step 1. Write 2x + 3 = 11.".into(), image_ref: Some("https://x/1.png".into()) },
            StepRecord { step_number: 2, step_description: "Step 2. Subtract 3.".into(), image_ref: None },
        ];
        let bytes = generate_pdf(&lesson, &steps).unwrap();
        assert!(bytes.starts_with(b"%PDF"));
    }
}
