/// One `<node>` from a `uiautomator dump` hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UiNode {
    pub text: String,
    pub content_desc: String,
    pub resource_id: String,
    pub class_name: String,
    pub bounds: Option<(i32, i32, i32, i32)>,
}

impl UiNode {
    pub fn center(&self) -> Option<(i32, i32)> {
        self.bounds
            .map(|(left, top, right, bottom)| ((left + right) / 2, (top + bottom) / 2))
    }

    pub fn matches_text(&self, needle: &str) -> bool {
        self.text == needle || self.content_desc == needle
    }
}

fn find_attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(attr_name, _)| attr_name == name)
        .map(|(_, value)| value.as_str())
}

fn unescape_xml(input: &str) -> String {
    if !input.contains('&') {
        return input.to_string();
    }
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// `[0,0][1080,2400]` → `(0, 0, 1080, 2400)`.
pub fn parse_bounds(value: &str) -> Option<(i32, i32, i32, i32)> {
    let numbers: Vec<i32> = value
        .split(|ch: char| ch == '[' || ch == ']' || ch == ',')
        .filter(|part| !part.is_empty())
        .map(|part| part.trim().parse::<i32>())
        .collect::<Result<_, _>>()
        .ok()?;
    match numbers.as_slice() {
        [left, top, right, bottom] => Some((*left, *top, *right, *bottom)),
        _ => None,
    }
}

/// Scans the dump for `<node ...>` tags. Tolerates truncated output by stopping at the
/// first malformed tag.
pub fn parse_ui_nodes(xml: &str) -> Vec<UiNode> {
    let bytes = xml.as_bytes();
    let mut index: usize = 0;
    let mut nodes = Vec::new();

    while index < bytes.len() {
        if bytes[index] != b'<' {
            index += 1;
            continue;
        }
        let start = index + 1;
        let mut cursor = start;
        while cursor < bytes.len() {
            let ch = bytes[cursor];
            if ch == b'/' || ch == b'>' || ch.is_ascii_whitespace() {
                break;
            }
            cursor += 1;
        }
        let tag_name = &xml[start..cursor];
        if tag_name != "node" {
            index = cursor.max(index + 1);
            continue;
        }

        let mut attrs: Vec<(String, String)> = Vec::new();
        let mut attr_cursor = cursor;
        let mut malformed = false;
        while attr_cursor < bytes.len() {
            while attr_cursor < bytes.len() && bytes[attr_cursor].is_ascii_whitespace() {
                attr_cursor += 1;
            }
            if attr_cursor >= bytes.len() {
                malformed = true;
                break;
            }
            let ch = bytes[attr_cursor];
            if ch == b'>' || ch == b'/' {
                attr_cursor += 1;
                break;
            }
            let name_start = attr_cursor;
            while attr_cursor < bytes.len()
                && bytes[attr_cursor] != b'='
                && !bytes[attr_cursor].is_ascii_whitespace()
            {
                attr_cursor += 1;
            }
            let name_end = attr_cursor;
            if attr_cursor + 1 >= bytes.len() || bytes[attr_cursor] != b'=' {
                malformed = true;
                break;
            }
            attr_cursor += 1;
            let quote = bytes[attr_cursor];
            if quote != b'"' && quote != b'\'' {
                malformed = true;
                break;
            }
            attr_cursor += 1;
            let value_start = attr_cursor;
            while attr_cursor < bytes.len() && bytes[attr_cursor] != quote {
                attr_cursor += 1;
            }
            if attr_cursor >= bytes.len() {
                malformed = true;
                break;
            }
            attrs.push((
                xml[name_start..name_end].to_string(),
                unescape_xml(&xml[value_start..attr_cursor]),
            ));
            attr_cursor += 1;
        }
        if malformed {
            break;
        }
        index = attr_cursor;

        nodes.push(UiNode {
            text: find_attr(&attrs, "text").unwrap_or_default().to_string(),
            content_desc: find_attr(&attrs, "content-desc")
                .unwrap_or_default()
                .to_string(),
            resource_id: find_attr(&attrs, "resource-id")
                .unwrap_or_default()
                .to_string(),
            class_name: find_attr(&attrs, "class").unwrap_or_default().to_string(),
            bounds: find_attr(&attrs, "bounds").and_then(parse_bounds),
        });
    }

    nodes
}

pub fn find_by_text<'a>(nodes: &'a [UiNode], needle: &str) -> Option<&'a UiNode> {
    nodes.iter().find(|node| node.matches_text(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "<?xml version='1.0' encoding='UTF-8' standalone='yes' ?><hierarchy rotation=\"0\"><node index=\"0\" text=\"\" resource-id=\"\" class=\"android.widget.FrameLayout\" bounds=\"[0,0][1080,2400]\"><node index=\"1\" text=\"Sign in\" resource-id=\"com.app:id/login\" class=\"android.widget.Button\" content-desc=\"\" bounds=\"[100,200][300,260]\" /><node index=\"2\" text=\"Terms &amp; Conditions\" content-desc=\"terms\" class=\"android.widget.TextView\" bounds=\"[0,2300][1080,2400]\" /></node></hierarchy>";

    #[test]
    fn parses_nodes_and_bounds() {
        let nodes = parse_ui_nodes(DUMP);
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[1].resource_id, "com.app:id/login");
        assert_eq!(nodes[1].center(), Some((200, 230)));
        assert_eq!(nodes[2].text, "Terms & Conditions");
    }

    #[test]
    fn finds_by_text_or_description() {
        let nodes = parse_ui_nodes(DUMP);
        assert!(find_by_text(&nodes, "Sign in").is_some());
        assert!(find_by_text(&nodes, "terms").is_some());
        assert!(find_by_text(&nodes, "Register").is_none());
    }

    #[test]
    fn truncated_dump_keeps_complete_nodes() {
        let truncated = &DUMP[..DUMP.find("content-desc=\"terms").unwrap_or(DUMP.len())];
        let nodes = parse_ui_nodes(truncated);
        assert_eq!(nodes.len(), 2);
        assert_eq!(parse_bounds("[1,2][3]"), None);
    }
}
