//! Plain header pairs, so this crate stays free of any concrete HTTP stack.

pub type Headers = Vec<(String, String)>;

pub fn header_set(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    for (existing, slot) in headers.iter_mut() {
        if existing.eq_ignore_ascii_case(&name) {
            *slot = value;
            return;
        }
    }
    headers.push((name, value));
}

pub fn header_append(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    headers.push((name.into(), value.into()));
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

pub fn header_remove(headers: &mut Headers, name: &str) -> Option<String> {
    let idx = headers
        .iter()
        .position(|(existing, _)| existing.eq_ignore_ascii_case(name))?;
    Some(headers.remove(idx).1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_case_insensitively() {
        let mut headers: Headers = vec![("Content-Type".to_string(), "text/plain".to_string())];
        header_set(&mut headers, "content-type", "application/json");
        assert_eq!(headers.len(), 1);
        assert_eq!(header_get(&headers, "CONTENT-TYPE"), Some("application/json"));
    }

    #[test]
    fn remove_returns_previous_value() {
        let mut headers: Headers = Vec::new();
        header_set(&mut headers, "Authorization", "Bearer x");
        assert_eq!(header_remove(&mut headers, "authorization").as_deref(), Some("Bearer x"));
        assert!(header_get(&headers, "Authorization").is_none());
    }
}
