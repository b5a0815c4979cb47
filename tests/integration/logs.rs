#[path = "common/mod.rs"]
mod common;

use std::{fs, time::Duration};

use common::{HEALTHY, ScriptService, Stack, fast_settings, wait_until};
use isomer::logs::LogStream;

const CHATTY: &str = r#"rm -f ready
echo "hello from stdout"
echo "warning on stderr" >&2
touch ready
exec sleep 600
"#;

const FLOOD: &str = r#"rm -f ready
i=0
while [ $i -lt 200 ]; do
  echo "line $i"
  i=$((i+1))
done
touch ready
exec sleep 600
"#;

#[test]
fn output_is_tagged_by_service_and_stream() {
    let stack = Stack::new(&[
        ScriptService::new("chain", CHATTY),
        ScriptService::new("indexer", HEALTHY).depends_on(&["chain"]),
    ]);
    let engine = stack.installed_engine();
    engine.start_services().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        engine.get_logs(Some("chain"), None).unwrap().len() >= 2
    }));

    let chain = engine.get_logs(Some("chain"), None).unwrap();
    assert!(chain.iter().all(|line| line.service == "chain"));
    assert!(chain.iter().any(|line| {
        line.stream == LogStream::Stdout && line.message == "hello from stdout"
    }));
    assert!(chain.iter().any(|line| {
        line.stream == LogStream::Stderr && line.message == "warning on stderr"
    }));

    assert!(wait_until(Duration::from_secs(5), || {
        !engine.get_logs(Some("indexer"), None).unwrap().is_empty()
    }));
    let all = engine.get_logs(None, None).unwrap();
    assert!(all.iter().any(|line| line.service == "indexer"));

    let persisted = stack.layout.log_file("chain", "stderr");
    assert!(wait_until(Duration::from_secs(5), || {
        fs::read_to_string(&persisted).is_ok_and(|content| content.contains("warning on stderr"))
    }));
}

#[test]
fn buffer_keeps_only_the_newest_lines() {
    let mut settings = fast_settings();
    settings.supervision.log_capacity = 50;
    let stack = Stack::with_settings(&[ScriptService::new("chain", FLOOD)], settings);
    let engine = stack.installed_engine();
    engine.start_services().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        engine
            .get_logs(None, None)
            .unwrap()
            .last()
            .is_some_and(|line| line.message == "line 199")
    }));

    let all = engine.get_logs(None, None).unwrap();
    assert_eq!(all.len(), 50);
    assert_eq!(all[0].message, "line 150");

    let recent = engine.get_logs(Some("chain"), Some(3)).unwrap();
    let messages: Vec<_> = recent.iter().map(|line| line.message.as_str()).collect();
    assert_eq!(messages, vec!["line 197", "line 198", "line 199"]);
}

#[test]
fn clear_logs_empties_the_buffer_but_not_the_files() {
    let stack = Stack::new(&[ScriptService::new("chain", CHATTY)]);
    let engine = stack.installed_engine();
    engine.start_services().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        engine.get_logs(None, None).unwrap().len() >= 2
    }));
    engine.clear_logs();
    assert!(engine.get_logs(None, None).unwrap().is_empty());

    let persisted = fs::read_to_string(stack.layout.log_file("chain", "stdout")).unwrap();
    assert!(persisted.contains("hello from stdout"));
}
