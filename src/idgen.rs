use rusqlite::{Connection, OptionalExtension};

/// Lowest student number the allocator will ever issue. Numbers below this
/// (and non-numeric values) are legacy data and ignored by the max-scan.
pub const STUDENT_NO_FLOOR: i64 = 1_070_010;

/// Parses a stored student_no into an allocator-valid number.
/// Returns None for non-numeric values and anything below the floor.
pub fn parse_student_no(raw: &str) -> Option<i64> {
    let n = raw.trim().parse::<i64>().ok()?;
    if n < STUDENT_NO_FLOOR {
        return None;
    }
    Some(n)
}

/// Next unused student number: max over all valid stored numbers, plus one,
/// or the floor when none qualify.
///
/// Read-only; the returned number is not reserved. Two concurrent callers can
/// be handed the same value, and the unique index on students.student_no is
/// what rejects the second insert. Callers must treat a constraint violation
/// as "try again", not as corruption.
pub fn next_student_no(conn: &Connection) -> String {
    match max_valid_student_no(conn) {
        Ok(Some(max)) => (max + 1).to_string(),
        Ok(None) => STUDENT_NO_FLOOR.to_string(),
        Err(_) => next_student_no_fallback(conn),
    }
}

fn max_valid_student_no(conn: &Connection) -> anyhow::Result<Option<i64>> {
    let mut stmt =
        conn.prepare("SELECT student_no FROM students WHERE student_no IS NOT NULL")?;
    let mut rows = stmt.query([])?;
    let mut max: Option<i64> = None;
    while let Some(row) = rows.next()? {
        let raw: String = row.get(0)?;
        if let Some(n) = parse_student_no(&raw) {
            max = Some(max.map_or(n, |m| m.max(n)));
        }
    }
    Ok(max)
}

/// Degraded path when the full scan fails: look only at the most recently
/// created row whose number carries no hyphen (hyphenated values are legacy
/// imports) and count up from it. Last resort is the floor itself.
fn next_student_no_fallback(conn: &Connection) -> String {
    let latest: Result<Option<String>, _> = conn
        .query_row(
            "SELECT student_no FROM students
             WHERE student_no IS NOT NULL AND student_no NOT LIKE '%-%'
             ORDER BY created_at DESC, rowid DESC
             LIMIT 1",
            [],
            |r| r.get(0),
        )
        .optional();
    match latest {
        Ok(Some(raw)) => match raw.trim().parse::<i64>() {
            Ok(n) => (n.max(STUDENT_NO_FLOOR - 1) + 1).to_string(),
            Err(_) => STUDENT_NO_FLOOR.to_string(),
        },
        _ => STUDENT_NO_FLOOR.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillSummary {
    pub assigned: usize,
    pub skipped: usize,
}

/// Assigns numbers to rows that lack a valid one, oldest-first.
///
/// Rows already holding a valid number are left untouched and push the
/// cursor past their value. Each candidate is probed against the store and
/// bumped on collision before it is written. Any db error aborts the run;
/// rows written before the error keep their new numbers.
pub fn backfill_student_nos(conn: &Connection) -> anyhow::Result<BackfillSummary> {
    let mut stmt = conn.prepare(
        "SELECT id, student_no FROM students ORDER BY created_at, rowid",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut cursor = STUDENT_NO_FLOOR;
    let mut assigned = 0usize;
    let mut skipped = 0usize;

    for (id, student_no) in rows {
        if let Some(n) = student_no.as_deref().and_then(parse_student_no) {
            skipped += 1;
            cursor = cursor.max(n + 1);
            continue;
        }

        while student_no_taken(conn, cursor)? {
            cursor += 1;
        }
        conn.execute(
            "UPDATE students
             SET student_no = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
             WHERE id = ?",
            (cursor.to_string(), &id),
        )?;
        assigned += 1;
        cursor += 1;
    }

    Ok(BackfillSummary { assigned, skipped })
}

fn student_no_taken(conn: &Connection, candidate: i64) -> anyhow::Result<bool> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students WHERE student_no = ?",
            [candidate.to_string()],
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}
