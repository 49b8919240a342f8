//! Static HTML report comparing one script's results across servers.
//!
//! The page embeds every server's log as JSON and renders it client side,
//! one tab per server and one column per client.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::ServerConfig;
use crate::error::FrameworkResult;
use crate::results::{ResultLine, ScriptResults};
use crate::script::{ClientId, Script};

/// How a line is shown in the report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Sent,
    Sync,
    Received,
    Disconnected,
}

#[derive(Debug, Serialize)]
struct ReportLine<'a> {
    client: &'a ClientId,
    kind: LineKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ReportServer<'a> {
    id: &'a str,
    name: &'a str,
    clients: Vec<&'a ClientId>,
    lines: Vec<ReportLine<'a>>,
}

#[derive(Debug, Serialize)]
struct ReportData<'a> {
    name: &'a str,
    description: &'a str,
    servers: Vec<ReportServer<'a>>,
}

fn report_line(line: &ResultLine) -> ReportLine<'_> {
    let kind = match line {
        ResultLine::Message { .. } => LineKind::Received,
        ResultLine::Disconnected { .. } => LineKind::Disconnected,
        ResultLine::ActionSync { line: Some(_), .. } => LineKind::Sent,
        ResultLine::ActionSync { line: None, .. } => LineKind::Sync,
    };
    ReportLine {
        client: line.client(),
        kind,
        line: line.raw_line(),
    }
}

/// Render the report. Servers appear in ascending ID order; servers with no
/// results are skipped.
pub fn render_html(
    script: &Script,
    servers: &BTreeMap<String, ServerConfig>,
    results: &BTreeMap<String, ScriptResults>,
) -> FrameworkResult<String> {
    let data = ReportData {
        name: &script.name,
        description: &script.short_description,
        servers: results
            .iter()
            .map(|(id, result)| ReportServer {
                id,
                name: servers
                    .get(id)
                    .map(|s| s.display_name.as_str())
                    .filter(|n| !n.is_empty())
                    .unwrap_or(id.as_str()),
                clients: result.clients.iter().collect(),
                lines: result.lines.iter().map(report_line).collect(),
            })
            .collect(),
    };

    let json = serde_json::to_string(&data)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
        // keep the blob from closing its own <script> element
        .replace("</", "<\\/");

    let title = if script.name.is_empty() {
        "Untitled script".to_string()
    } else {
        escape_html(&script.name)
    };

    Ok(TEMPLATE
        .replace("{{title}}", &title)
        .replace("{{description}}", &escape_html(&script.short_description))
        .replace("{{data}}", &json))
}

/// Write the report to `output`, or to a new temp file that is kept.
pub fn write_report(html: &str, output: Option<&Path>) -> FrameworkResult<PathBuf> {
    match output {
        Some(path) => {
            std::fs::write(path, html)?;
            Ok(path.to_path_buf())
        }
        None => {
            let file = tempfile::Builder::new()
                .prefix("irc-test-framework.")
                .suffix(".html")
                .tempfile()?;
            std::fs::write(file.path(), html)?;
            let (_, path) = file.keep().map_err(|e| e.error)?;
            Ok(path)
        }
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

const TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{{title}} - IRC Test Framework</title>
<style>
body { font-family: sans-serif; margin: 0; display: flex; flex-direction: column; min-height: 100vh; }
header { padding: 0 0.7em; }
h1 { color: #243847; margin: 0.4em 0 0.1em; }
.desc { color: #455e6e; display: block; padding-bottom: 1em; }
.tabs { display: flex; gap: 0.3em; padding: 0 0.7em; }
.tabs button { border: 0; padding: 0.4em 0.9em; background: #d8d8b0; cursor: pointer; }
.tabs button.active { background: #aeae65; font-weight: bold; }
.content { flex: 1; background: #aeae65; padding: 0.7em; overflow-x: auto; }
table { border-collapse: collapse; font-family: monospace; width: 100%; }
th { text-align: left; padding: 0.2em 0.5em; }
td { vertical-align: top; padding: 0.1em 0.5em; white-space: pre-wrap; word-break: break-all; }
tr.sync td { border-top: 1px solid #7d7d45; }
.sent { color: #0b3d91; font-weight: bold; }
.received { color: #222; }
.disconnected { color: #a00; font-style: italic; }
footer { padding: 0.3em 0.7em; font-size: 0.9em; }
</style>
</head>
<body>
<header>
<h1>{{title}}</h1>
<span class="desc">{{description}}</span>
</header>
<div class="tabs" id="tabs"></div>
<div class="content" id="content"></div>
<footer>Generated by testfw</footer>
<script type="application/json" id="results">{{data}}</script>
<script>
(function () {
  var data = JSON.parse(document.getElementById("results").textContent);
  var tabs = document.getElementById("tabs");
  var content = document.getElementById("content");

  function cell(text, cls) {
    var td = document.createElement("td");
    if (text !== undefined) { td.textContent = text; }
    if (cls) { td.className = cls; }
    return td;
  }

  function show(server, button) {
    Array.prototype.forEach.call(tabs.children, function (b) { b.classList.remove("active"); });
    button.classList.add("active");
    content.innerHTML = "";

    var table = document.createElement("table");
    var head = document.createElement("tr");
    server.clients.forEach(function (c) {
      var th = document.createElement("th");
      th.textContent = c;
      head.appendChild(th);
    });
    table.appendChild(head);

    server.lines.forEach(function (line) {
      var row = document.createElement("tr");
      if (line.kind === "sent" || line.kind === "sync") { row.className = "sync"; }
      server.clients.forEach(function (c) {
        if (c !== line.client) { row.appendChild(cell()); return; }
        var text = line.line;
        if (line.kind === "sent") { text = "-> " + text; }
        else if (line.kind === "received") { text = "<- " + text; }
        else if (line.kind === "disconnected") { text = "(disconnected)"; }
        else { text = ""; }
        row.appendChild(cell(text, line.kind));
      });
      table.appendChild(row);
    });
    content.appendChild(table);
  }

  data.servers.forEach(function (server, i) {
    var button = document.createElement("button");
    button.textContent = server.name;
    button.onclick = function () { show(server, button); };
    tabs.appendChild(button);
    if (i === 0) { show(server, button); }
  });
})();
</script>
</body>
</html>
"#;
