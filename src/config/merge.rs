use std::path::Path;

use color_eyre::Result;
use color_eyre::eyre::eyre;
use toml::Value;
use toml::map::{Entry, Map};

/// Deep-merge `addition` into `target`. Tables merge key by key; any other
/// value replaces what was there. The string `"null"` removes the key.
pub fn merge_tables(
    target: &mut Map<String, Value>,
    addition: Map<String, Value>,
    source_path: Option<&Path>,
) -> Result<()> {
    for (key, value) in addition {
        if is_null(&value) {
            target.remove(&key);
            continue;
        }

        match (target.entry(key.clone()), value) {
            (Entry::Occupied(mut occ), Value::Table(table)) => match occ.get_mut() {
                Value::Table(existing) => merge_tables(existing, table, source_path)?,
                other => {
                    return Err(eyre!(
                        "cannot merge table '{key}' into a {}",
                        other.type_str()
                    )
                    .wrap_err(origin(source_path)));
                }
            },
            (Entry::Occupied(mut occ), value) => {
                occ.insert(value);
            }
            (Entry::Vacant(vac), value) => {
                vac.insert(value);
            }
        }
    }

    Ok(())
}

fn origin(source: Option<&Path>) -> String {
    match source {
        Some(path) => format!("while merging {}", path.display()),
        None => "while merging configuration".to_string(),
    }
}

fn is_null(value: &Value) -> bool {
    matches!(value, Value::String(s) if s.eq_ignore_ascii_case("null"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(text: &str) -> Map<String, Value> {
        match toml::from_str::<Value>(text) {
            Ok(Value::Table(table)) => table,
            other => panic!("expected a table, got {other:?}"),
        }
    }

    #[test]
    fn nested_tables_merge_and_scalars_replace() -> Result<()> {
        let mut base = table(
            r#"
            [session]
            model_name = "llama-3.1-8b-instant"
            max_cycles = 5
            [session.thresholds]
            overall = 8
            "#,
        );
        merge_tables(
            &mut base,
            table(
                r"
                [session]
                max_cycles = 2
                [session.thresholds]
                empathy = 6
                ",
            ),
            None,
        )?;

        let session = &base["session"];
        assert_eq!(session["model_name"].as_str(), Some("llama-3.1-8b-instant"));
        assert_eq!(session["max_cycles"].as_integer(), Some(2));
        assert_eq!(session["thresholds"]["overall"].as_integer(), Some(8));
        assert_eq!(session["thresholds"]["empathy"].as_integer(), Some(6));
        Ok(())
    }

    #[test]
    fn null_string_removes_key() -> Result<()> {
        let mut base = table("[server]\narchive_db = '/tmp/history.db'\n");
        merge_tables(&mut base, table("[server]\narchive_db = 'null'\n"), None)?;
        assert!(base["server"].get("archive_db").is_none());
        Ok(())
    }

    #[test]
    fn table_over_scalar_is_an_error() {
        let mut base = table("session = 'oops'\n");
        let err = merge_tables(
            &mut base,
            table("[session]\nmax_cycles = 1\n"),
            Some(Path::new("conf.d/10-session.toml")),
        )
        .unwrap_err();
        assert!(format!("{err:?}").contains("conf.d/10-session.toml"));
    }
}
