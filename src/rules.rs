use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;

/// Institutional per-period credit ceiling. Enrollment that would push a
/// student past this total is refused.
pub const MAX_PERIOD_CREDITS: i64 = 18;

/// Minimum weighted total required to pass a section, on a 0-100 scale.
/// Only applies once every evaluation has a recorded grade.
pub const PASS_MARK: f64 = 70.0;

/// Half-up rounding to one decimal, the registrar's published rounding rule:
/// `floor(10*x + 0.5) / 10`
pub fn round_half_up_1(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

/// A score is recordable when it is a real number on the 0-100 scale.
/// Enforced at grade entry so the aggregator never sees anything else.
pub fn valid_score(score: f64) -> bool {
    score.is_finite() && (0.0..=100.0).contains(&score)
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RuleError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationWeight {
    pub id: String,
    pub weight_percent: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightCheck {
    pub valid: bool,
    pub message: String,
    pub available_percent: i64,
}

/// Checks that a candidate weight keeps the section's cumulative weight at or
/// below 100%. Create and edit share this path: an edit passes the id of the
/// evaluation being edited so its current weight drops out of the sum.
/// Range validation of the candidate (1-100) is the caller's job.
pub fn check_evaluation_weight(
    candidate_percent: i64,
    existing: &[EvaluationWeight],
    exclude_id: Option<&str>,
) -> WeightCheck {
    let used: i64 = existing
        .iter()
        .filter(|e| exclude_id != Some(e.id.as_str()))
        .map(|e| e.weight_percent)
        .sum();
    let available_percent = 100 - used;
    let valid = candidate_percent <= available_percent;
    let message = if valid {
        "weight accepted".to_string()
    } else {
        format!(
            "evaluations for this section already use {}%; only {}% remains",
            used, available_percent
        )
    };
    WeightCheck {
        valid,
        message,
        available_percent,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradeRecord {
    pub evaluation_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeSummary {
    pub weighted_total: f64,
    pub percent_covered: i64,
    pub passed: bool,
}

/// Weighted partial/final average for one student in one section.
///
/// Each evaluation with a recorded grade contributes
/// `score * weight_percent / 100` to the total and its weight to the covered
/// percentage; ungraded evaluations contribute nothing (no proration). A
/// student passes only on a complete record: full coverage and a total at or
/// above [`PASS_MARK`]. This is the single implementation behind both the
/// student summary and the section roster.
pub fn aggregate_grades(evaluations: &[EvaluationWeight], grades: &[GradeRecord]) -> GradeSummary {
    let mut score_by_evaluation: HashMap<&str, f64> = HashMap::new();
    for g in grades {
        score_by_evaluation.insert(g.evaluation_id.as_str(), g.score);
    }

    let mut weighted_total = 0.0_f64;
    let mut percent_covered = 0_i64;
    for e in evaluations {
        let Some(score) = score_by_evaluation.get(e.id.as_str()) else {
            continue;
        };
        weighted_total += score * (e.weight_percent as f64) / 100.0;
        percent_covered += e.weight_percent;
    }

    let weighted_total = round_half_up_1(weighted_total);
    GradeSummary {
        weighted_total,
        percent_covered,
        passed: weighted_total >= PASS_MARK && percent_covered == 100,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SectionLoad {
    pub section_id: String,
    pub course_code: String,
    pub credits: i64,
    pub day: String,
    pub start_time: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentCheck {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl EnrollmentCheck {
    fn accept() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    fn reject(reason: String) -> Self {
        Self {
            ok: false,
            reason: Some(reason),
        }
    }
}

/// Optimistic pre-flight gate for enrollment: credit ceiling and schedule
/// collision against the student's current load. Acceptance is provisional;
/// the authoritative create re-checks and additionally enforces capacity and
/// duplicates against live data.
///
/// Collision means an identical (day, startTime) pair. Overlapping ranges
/// with different start times are not flagged; back-to-back and staggered
/// sections are allowed through.
pub fn check_enrollment(candidate: &SectionLoad, enrolled: &[SectionLoad]) -> EnrollmentCheck {
    let current_credits: i64 = enrolled.iter().map(|s| s.credits).sum();
    let total = current_credits + candidate.credits;
    if total > MAX_PERIOD_CREDITS {
        return EnrollmentCheck::reject(format!(
            "enrolling would bring the load to {} credits; the limit is {}",
            total, MAX_PERIOD_CREDITS
        ));
    }

    for s in enrolled {
        if s.day == candidate.day && s.start_time == candidate.start_time {
            return EnrollmentCheck::reject(format!(
                "schedule conflict with {} on {} at {}",
                s.course_code, s.day, s.start_time
            ));
        }
    }

    EnrollmentCheck::accept()
}

#[derive(Debug, Clone)]
pub struct SectionInfo {
    pub section_id: String,
    pub course_id: String,
    pub course_code: String,
    pub course_name: String,
    pub credits: i64,
    pub teacher_id: String,
    pub period: String,
    pub day: String,
    pub start_time: String,
    pub end_time: String,
    pub capacity: i64,
}

pub fn load_section_info(conn: &Connection, section_id: &str) -> Result<SectionInfo, RuleError> {
    let row = conn
        .query_row(
            "SELECT s.id, s.course_id, c.code, c.name, c.credits, s.teacher_id,
                    s.period, s.day, s.start_time, s.end_time, s.capacity
             FROM sections s
             JOIN courses c ON c.id = s.course_id
             WHERE s.id = ?",
            [section_id],
            |r| {
                Ok(SectionInfo {
                    section_id: r.get(0)?,
                    course_id: r.get(1)?,
                    course_code: r.get(2)?,
                    course_name: r.get(3)?,
                    credits: r.get(4)?,
                    teacher_id: r.get(5)?,
                    period: r.get(6)?,
                    day: r.get(7)?,
                    start_time: r.get(8)?,
                    end_time: r.get(9)?,
                    capacity: r.get(10)?,
                })
            },
        )
        .optional()
        .map_err(|e| RuleError::new("db_query_failed", e.to_string()))?;
    row.ok_or_else(|| RuleError::new("not_found", "section not found"))
}

/// The student's enrolled sections for one period, shaped for
/// [`check_enrollment`]. The ceiling and the collision rule both read a
/// single term's load; other periods do not count against it.
pub fn load_period_load(
    conn: &Connection,
    student_id: &str,
    period: &str,
) -> Result<Vec<SectionLoad>, RuleError> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, c.code, c.credits, s.day, s.start_time
             FROM enrollments e
             JOIN sections s ON s.id = e.section_id
             JOIN courses c ON c.id = s.course_id
             WHERE e.student_id = ? AND s.period = ?
             ORDER BY s.day, s.start_time",
        )
        .map_err(|e| RuleError::new("db_query_failed", e.to_string()))?;
    stmt.query_map((student_id, period), |r| {
        Ok(SectionLoad {
            section_id: r.get(0)?,
            course_code: r.get(1)?,
            credits: r.get(2)?,
            day: r.get(3)?,
            start_time: r.get(4)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| RuleError::new("db_query_failed", e.to_string()))
}

pub fn load_section_weights(
    conn: &Connection,
    section_id: &str,
) -> Result<Vec<EvaluationWeight>, RuleError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, weight_percent FROM evaluations WHERE section_id = ? ORDER BY title",
        )
        .map_err(|e| RuleError::new("db_query_failed", e.to_string()))?;
    stmt.query_map([section_id], |r| {
        Ok(EvaluationWeight {
            id: r.get(0)?,
            weight_percent: r.get(1)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| RuleError::new("db_query_failed", e.to_string()))
}

fn load_enrollment_grades(
    conn: &Connection,
    enrollment_id: &str,
) -> Result<Vec<GradeRecord>, RuleError> {
    let mut stmt = conn
        .prepare("SELECT evaluation_id, score FROM grades WHERE enrollment_id = ?")
        .map_err(|e| RuleError::new("db_query_failed", e.to_string()))?;
    stmt.query_map([enrollment_id], |r| {
        Ok(GradeRecord {
            evaluation_id: r.get(0)?,
            score: r.get(1)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| RuleError::new("db_query_failed", e.to_string()))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRef {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentCourseCard {
    pub enrollment_id: String,
    pub section_id: String,
    pub course_code: String,
    pub course_name: String,
    pub credits: i64,
    pub period: String,
    pub day: String,
    pub start_time: String,
    pub end_time: String,
    pub teacher_name: String,
    pub evaluation_count: usize,
    pub graded_count: usize,
    pub summary: GradeSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSummaryModel {
    pub student: StudentRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
    pub total_credits: i64,
    pub cards: Vec<StudentCourseCard>,
}

#[derive(Debug, Clone)]
struct EnrolledSectionRow {
    enrollment_id: String,
    section_id: String,
    course_code: String,
    course_name: String,
    credits: i64,
    period: String,
    day: String,
    start_time: String,
    end_time: String,
    teacher_name: String,
}

/// Per-section grade cards for one student: the model behind the student
/// course-card view. Goes through [`aggregate_grades`] for every card.
pub fn compute_student_summary(
    conn: &Connection,
    student_id: &str,
    period: Option<&str>,
) -> Result<StudentSummaryModel, RuleError> {
    let student: Option<(String, String)> = conn
        .query_row(
            "SELECT last_name, first_name FROM users WHERE id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| RuleError::new("db_query_failed", e.to_string()))?;
    let Some((last, first)) = student else {
        return Err(RuleError::new("not_found", "student not found"));
    };

    let sql = "SELECT e.id, s.id, c.code, c.name, c.credits, s.period,
                      s.day, s.start_time, s.end_time, t.last_name, t.first_name
               FROM enrollments e
               JOIN sections s ON s.id = e.section_id
               JOIN courses c ON c.id = s.course_id
               JOIN users t ON t.id = s.teacher_id
               WHERE e.student_id = ?1 AND (?2 IS NULL OR s.period = ?2)
               ORDER BY s.period, c.code";
    let mut stmt = stmt_or_rule_err(conn, sql)?;
    let rows: Vec<EnrolledSectionRow> = stmt
        .query_map((student_id, period), |r| {
            let teacher_last: String = r.get(9)?;
            let teacher_first: String = r.get(10)?;
            Ok(EnrolledSectionRow {
                enrollment_id: r.get(0)?,
                section_id: r.get(1)?,
                course_code: r.get(2)?,
                course_name: r.get(3)?,
                credits: r.get(4)?,
                period: r.get(5)?,
                day: r.get(6)?,
                start_time: r.get(7)?,
                end_time: r.get(8)?,
                teacher_name: format!("{}, {}", teacher_last, teacher_first),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| RuleError::new("db_query_failed", e.to_string()))?;

    let mut total_credits = 0_i64;
    let mut cards = Vec::with_capacity(rows.len());
    for row in rows {
        let evaluations = load_section_weights(conn, &row.section_id)?;
        let grades = load_enrollment_grades(conn, &row.enrollment_id)?;
        let summary = aggregate_grades(&evaluations, &grades);
        total_credits += row.credits;
        cards.push(StudentCourseCard {
            enrollment_id: row.enrollment_id,
            section_id: row.section_id,
            course_code: row.course_code,
            course_name: row.course_name,
            credits: row.credits,
            period: row.period,
            day: row.day,
            start_time: row.start_time,
            end_time: row.end_time,
            teacher_name: row.teacher_name,
            evaluation_count: evaluations.len(),
            graded_count: grades.len(),
            summary,
        });
    }

    Ok(StudentSummaryModel {
        student: StudentRef {
            id: student_id.to_string(),
            display_name: format!("{}, {}", last, first),
        },
        period: period.map(|p| p.to_string()),
        total_credits,
        cards,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEvaluation {
    pub id: String,
    pub title: String,
    pub type_name: String,
    pub weight_percent: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterRow {
    pub enrollment_id: String,
    pub student_id: String,
    pub display_name: String,
    pub scores: Vec<Option<f64>>,
    pub summary: GradeSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionRosterModel {
    pub section_id: String,
    pub course_code: String,
    pub course_name: String,
    pub period: String,
    pub weight_total: i64,
    pub evaluations: Vec<RosterEvaluation>,
    pub rows: Vec<RosterRow>,
}

/// The instructor's grade roster for one section: every enrolled student with
/// per-evaluation scores and the same [`aggregate_grades`] summary the
/// student sees on their own card.
pub fn compute_section_roster(
    conn: &Connection,
    section_id: &str,
) -> Result<SectionRosterModel, RuleError> {
    let info = load_section_info(conn, section_id)?;

    let mut eval_stmt = stmt_or_rule_err(
        conn,
        "SELECT ev.id, ev.title, et.name, ev.weight_percent
         FROM evaluations ev
         JOIN evaluation_types et ON et.id = ev.evaluation_type_id
         WHERE ev.section_id = ?
         ORDER BY ev.title",
    )?;
    let evaluations: Vec<RosterEvaluation> = eval_stmt
        .query_map([section_id], |r| {
            Ok(RosterEvaluation {
                id: r.get(0)?,
                title: r.get(1)?,
                type_name: r.get(2)?,
                weight_percent: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| RuleError::new("db_query_failed", e.to_string()))?;

    let weights: Vec<EvaluationWeight> = evaluations
        .iter()
        .map(|ev| EvaluationWeight {
            id: ev.id.clone(),
            weight_percent: ev.weight_percent,
        })
        .collect();
    let weight_total: i64 = weights.iter().map(|w| w.weight_percent).sum();

    let mut enroll_stmt = stmt_or_rule_err(
        conn,
        "SELECT e.id, u.id, u.last_name, u.first_name
         FROM enrollments e
         JOIN users u ON u.id = e.student_id
         WHERE e.section_id = ?
         ORDER BY u.last_name, u.first_name",
    )?;
    let enrolled: Vec<(String, String, String, String)> = enroll_stmt
        .query_map([section_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| RuleError::new("db_query_failed", e.to_string()))?;

    let mut rows = Vec::with_capacity(enrolled.len());
    for (enrollment_id, student_id, last, first) in enrolled {
        let grades = load_enrollment_grades(conn, &enrollment_id)?;
        let mut score_by_evaluation: HashMap<&str, f64> = HashMap::new();
        for g in &grades {
            score_by_evaluation.insert(g.evaluation_id.as_str(), g.score);
        }
        let scores: Vec<Option<f64>> = evaluations
            .iter()
            .map(|ev| score_by_evaluation.get(ev.id.as_str()).copied())
            .collect();
        let summary = aggregate_grades(&weights, &grades);
        rows.push(RosterRow {
            enrollment_id,
            student_id,
            display_name: format!("{}, {}", last, first),
            scores,
            summary,
        });
    }

    Ok(SectionRosterModel {
        section_id: info.section_id,
        course_code: info.course_code,
        course_name: info.course_name,
        period: info.period,
        weight_total,
        evaluations,
        rows,
    })
}

fn stmt_or_rule_err<'a>(
    conn: &'a Connection,
    sql: &str,
) -> Result<rusqlite::Statement<'a>, RuleError> {
    conn.prepare(sql)
        .map_err(|e| RuleError::new("db_query_failed", e.to_string()))
}
