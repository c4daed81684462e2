use crate::idgen;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    fn db(e: rusqlite::Error) -> HandlerErr {
        HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }
    }
}

fn require_db<'a>(state: &'a AppState) -> Result<&'a Connection, HandlerErr> {
    state.db.as_ref().ok_or(HandlerErr {
        code: "no_workspace",
        message: "select a workspace first".to_string(),
        details: None,
    })
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn duplicate_no_err() -> HandlerErr {
    HandlerErr {
        code: "duplicate_student_no",
        message: "student number already in use".to_string(),
        details: None,
    }
}

fn insert_err(e: rusqlite::Error) -> HandlerErr {
    if is_unique_violation(&e) {
        duplicate_no_err()
    } else {
        HandlerErr {
            code: "db_insert_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "students" })),
        }
    }
}

fn update_err(e: rusqlite::Error) -> HandlerErr {
    if is_unique_violation(&e) {
        duplicate_no_err()
    } else {
        HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "students" })),
        }
    }
}

fn student_row_json(row: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    let id: String = row.get(0)?;
    let last_name: String = row.get(1)?;
    let first_name: String = row.get(2)?;
    let student_no: Option<String> = row.get(3)?;
    let active: i64 = row.get(4)?;
    let created_at: String = row.get(5)?;

    let display_name = format!("{}, {}", last_name, first_name);
    let student_no = student_no.and_then(|s| {
        let t = s.trim().to_string();
        if t.is_empty() {
            None
        } else {
            Some(t)
        }
    });

    Ok(json!({
        "id": id,
        "lastName": last_name,
        "firstName": first_name,
        "displayName": display_name,
        "studentNo": student_no,
        "active": active != 0,
        "createdAt": created_at
    }))
}

fn handle_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, student_no, active, created_at
             FROM students
             ORDER BY last_name, first_name",
        )
        .map_err(HandlerErr::db)?;
    let students = stmt
        .query_map([], student_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(ok(&req.id, json!({ "students": students })))
}

fn handle_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;

    let last_name = get_required_str(&req.params, "lastName")?;
    let first_name = get_required_str(&req.params, "firstName")?;
    if last_name.is_empty() || first_name.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "firstName/lastName must not be empty".to_string(),
            details: None,
        });
    }
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    // Caller-supplied numbers pass through unchanged (legacy imports carry
    // their own); otherwise the allocator picks the next free one.
    let student_no = match get_optional_str(&req.params, "studentNo") {
        Some(v) => v,
        None => idgen::next_student_no(conn),
    };

    let student_id = Uuid::new_v4().to_string();
    let created_at = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    conn.execute(
        "INSERT INTO students(id, last_name, first_name, student_no, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &last_name,
            &first_name,
            &student_no,
            if active { 1 } else { 0 },
            &created_at,
        ),
    )
    .map_err(insert_err)?;

    Ok(ok(
        &req.id,
        json!({ "studentId": student_id, "studentNo": student_no }),
    ))
}

fn handle_update(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "missing patch object".to_string(),
            details: None,
        });
    };

    // Validate every key before touching the row, then apply the whole
    // patch as one UPDATE. A patch that fails must not take partial effect.
    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    for (key, value) in patch {
        match key.as_str() {
            "lastName" | "firstName" => {
                let Some(s) = value.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
                    return Err(HandlerErr {
                        code: "bad_params",
                        message: format!("{} must be a non-empty string", key),
                        details: None,
                    });
                };
                let col = if key == "lastName" {
                    "last_name"
                } else {
                    "first_name"
                };
                set_parts.push(format!("{} = ?", col));
                bind_values.push(Value::Text(s.to_string()));
            }
            "studentNo" => {
                // null clears the number; a string replaces it.
                if value.is_null() {
                    set_parts.push("student_no = ?".to_string());
                    bind_values.push(Value::Null);
                } else {
                    match value.as_str().map(str::trim).filter(|s| !s.is_empty()) {
                        Some(s) => {
                            set_parts.push("student_no = ?".to_string());
                            bind_values.push(Value::Text(s.to_string()));
                        }
                        None => {
                            return Err(HandlerErr {
                                code: "bad_params",
                                message: "studentNo must be a non-empty string or null"
                                    .to_string(),
                                details: None,
                            })
                        }
                    }
                }
            }
            "active" => {
                let Some(b) = value.as_bool() else {
                    return Err(HandlerErr {
                        code: "bad_params",
                        message: "active must be a boolean".to_string(),
                        details: None,
                    });
                };
                set_parts.push("active = ?".to_string());
                bind_values.push(Value::Integer(if b { 1 } else { 0 }));
            }
            other => {
                return Err(HandlerErr {
                    code: "bad_params",
                    message: format!("unknown patch key: {}", other),
                    details: None,
                });
            }
        }
    }

    if set_parts.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "patch must include at least one field".to_string(),
            details: None,
        });
    }
    set_parts.push("updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')".to_string());

    let sql = format!(
        "UPDATE students SET {} WHERE id = ?",
        set_parts.join(", ")
    );
    bind_values.push(Value::Text(student_id.clone()));

    let changed = conn
        .execute(&sql, params_from_iter(bind_values))
        .map_err(update_err)?;
    if changed == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    Ok(ok(&req.id, json!({ "studentId": student_id })))
}

fn handle_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = get_required_str(&req.params, "studentId")?;
    let n = conn
        .execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(HandlerErr::db)?;
    if n == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }
    Ok(ok(&req.id, json!({ "deleted": true })))
}

fn handle_next_no(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    // Preview only: the number is not reserved until a create lands it.
    Ok(ok(
        &req.id,
        json!({ "studentNo": idgen::next_student_no(conn) }),
    ))
}

fn handle_backfill_nos(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let summary = idgen::backfill_student_nos(conn).map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(ok(
        &req.id,
        json!({ "assigned": summary.assigned, "skipped": summary.skipped }),
    ))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let res = match req.method.as_str() {
        "students.list" => handle_list(state, req),
        "students.create" => handle_create(state, req),
        "students.update" => handle_update(state, req),
        "students.delete" => handle_delete(state, req),
        "students.nextNo" => handle_next_no(state, req),
        "students.backfillNos" => handle_backfill_nos(state, req),
        _ => return None,
    };
    Some(res.unwrap_or_else(|e| e.response(&req.id)))
}
