use super::{
    header::{canonical_name, CSeq, Header, Headers, NameAddr, Via, MULTI_VALUE_HEADERS},
    message::{Request, Response, SipMessage},
    method::Method,
    uri::{HostPort, Param, SipUri},
};
use crate::{Error, Result};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_till, take_till1, take_while1},
    character::complete::{char, digit1, space0, space1},
    combinator::{map, map_res, opt, recognize, rest},
    multi::{many0, separated_list0},
    sequence::{delimited, preceded, terminated},
    IResult, Parser,
};

type Res<'a, T> = IResult<&'a str, T>;

pub(crate) fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c)
}

fn is_param_value_char(c: char) -> bool {
    is_token_char(c) || "[]:/@&$".contains(c)
}

fn token(input: &str) -> Res<&str> {
    take_while1(is_token_char).parse(input)
}

fn quoted_string(input: &str) -> Res<&str> {
    delimited(char('"'), take_till(|c: char| c == '"'), char('"')).parse(input)
}

fn param(input: &str) -> Res<Param> {
    let (input, name) = token(input)?;
    let (input, value) = opt(preceded(
        (space0, char('='), space0),
        alt((recognize(quoted_string), take_while1(is_param_value_char))),
    ))
    .parse(input)?;
    Ok((input, Param::new(name, value.map(|v| v.to_string()))))
}

fn params(input: &str) -> Res<Vec<Param>> {
    many0(preceded((space0, char(';'), space0), param)).parse(input)
}

fn host(input: &str) -> Res<&str> {
    alt((
        delimited(char('['), take_till1(|c: char| c == ']'), char(']')),
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_'),
    ))
    .parse(input)
}

fn host_port(input: &str) -> Res<HostPort> {
    let (input, host) = host(input)?;
    let (input, port) =
        opt(preceded(char(':'), map_res(digit1, |p: &str| p.parse::<u16>()))).parse(input)?;
    Ok((input, HostPort::new(host, port)))
}

fn scheme(input: &str) -> Res<&str> {
    terminated(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.'),
        char(':'),
    )
    .parse(input)
}

fn uri_body(input: &str, with_params: bool) -> Res<SipUri> {
    let (input, scheme) = scheme(input)?;
    if scheme.eq_ignore_ascii_case("tel") {
        let (input, number) =
            take_while1(|c: char| !matches!(c, ';' | '>' | '?' | ' ' | '\t' | ',')).parse(input)?;
        let (input, params) = if with_params {
            params(input)?
        } else {
            (input, Vec::new())
        };
        return Ok((
            input,
            SipUri {
                scheme: scheme.to_ascii_lowercase(),
                user: Some(number.to_string()),
                password: None,
                host: HostPort::default(),
                params,
                headers: None,
            },
        ));
    }
    let (input, userinfo) = opt(terminated(
        take_till1(|c: char| matches!(c, '@' | '>' | ' ' | '\t' | ',')),
        char('@'),
    ))
    .parse(input)?;
    let (input, host) = host_port(input)?;
    let (input, params) = if with_params {
        params(input)?
    } else {
        (input, Vec::new())
    };
    let (input, headers) = if with_params {
        opt(preceded(
            char('?'),
            take_till(|c: char| matches!(c, '>' | ' ' | '\t' | ',')),
        ))
        .parse(input)?
    } else {
        (input, None)
    };
    let (user, password) = match userinfo {
        Some(info) => match info.split_once(':') {
            Some((user, password)) => (Some(user.to_string()), Some(password.to_string())),
            None => (Some(info.to_string()), None),
        },
        None => (None, None),
    };
    Ok((
        input,
        SipUri {
            scheme: scheme.to_ascii_lowercase(),
            user,
            password,
            host,
            params,
            headers: headers.map(|h| h.to_string()),
        },
    ))
}

fn uri(input: &str) -> Res<SipUri> {
    uri_body(input, true)
}

fn display_name(input: &str) -> Res<String> {
    alt((
        map(quoted_string, |s: &str| s.to_string()),
        map(take_till1(|c: char| c == '<' || c == '"'), |s: &str| {
            s.trim().to_string()
        }),
    ))
    .parse(input)
}

fn bracketed_name_addr(input: &str) -> Res<NameAddr> {
    let (input, display) = opt(display_name).parse(input)?;
    let (input, _) = space0(input)?;
    let (input, uri) = delimited(char('<'), uri, char('>')).parse(input)?;
    let (input, params) = params(input)?;
    Ok((
        input,
        NameAddr {
            display_name: display.filter(|d| !d.is_empty()),
            uri,
            params,
        },
    ))
}

// Without angle brackets everything after the URI is a header parameter.
fn bare_name_addr(input: &str) -> Res<NameAddr> {
    let (input, uri) = uri_body(input, false)?;
    let (input, params) = params(input)?;
    Ok((
        input,
        NameAddr {
            display_name: None,
            uri,
            params,
        },
    ))
}

fn name_addr(input: &str) -> Res<NameAddr> {
    preceded(space0, alt((bracketed_name_addr, bare_name_addr))).parse(input)
}

fn via(input: &str) -> Res<Via> {
    let (input, _) = space0(input)?;
    let (input, _) = (tag("SIP"), space0, char('/'), space0, tag("2.0"), space0, char('/'), space0)
        .parse(input)?;
    let (input, transport) = token(input)?;
    let (input, _) = space1(input)?;
    let (input, sent_by) = host_port(input)?;
    let (input, params) = params(input)?;
    Ok((
        input,
        Via {
            transport: transport.to_ascii_uppercase(),
            sent_by,
            params,
        },
    ))
}

fn cseq(input: &str) -> Res<CSeq> {
    let (input, _) = space0(input)?;
    let (input, seq) = map_res(digit1, |s: &str| s.parse::<u32>()).parse(input)?;
    let (input, _) = space1(input)?;
    let (input, method) = map_res(token, |m: &str| m.parse::<Method>()).parse(input)?;
    Ok((input, CSeq { seq, method }))
}

fn auth_param(input: &str) -> Res<(String, String)> {
    let (input, name) = token(input)?;
    let (input, _) = (space0, char('='), space0).parse(input)?;
    let (input, value) = alt((
        quoted_string,
        take_till(|c: char| c == ',' || c.is_ascii_whitespace()),
    ))
    .parse(input)?;
    Ok((input, (name.to_ascii_lowercase(), value.to_string())))
}

fn auth_header(input: &str) -> Res<(String, Vec<(String, String)>)> {
    let (input, _) = space0(input)?;
    let (input, scheme) = token(input)?;
    let (input, _) = space1(input)?;
    let (input, params) =
        separated_list0((space0, char(','), space0), auth_param).parse(input)?;
    Ok((input, (scheme.to_string(), params)))
}

enum StartLine {
    Request(Method, SipUri),
    Response(u16, String),
}

fn status_line(input: &str) -> Res<StartLine> {
    let (input, _) = (tag("SIP/2.0"), space1).parse(input)?;
    let (input, status) = map_res(digit1, |s: &str| s.parse::<u16>()).parse(input)?;
    let (input, reason) = opt(preceded(space1, rest)).parse(input)?;
    Ok((
        input,
        StartLine::Response(status, reason.unwrap_or_default().trim().to_string()),
    ))
}

fn request_line(input: &str) -> Res<StartLine> {
    let (input, method) = map_res(token, |m: &str| m.parse::<Method>()).parse(input)?;
    let (input, _) = space1(input)?;
    let (input, uri) = uri(input)?;
    let (input, _) = (space1, tag("SIP/2.0")).parse(input)?;
    Ok((input, StartLine::Request(method, uri)))
}

fn header_line(input: &str) -> Res<(&str, &str)> {
    let (input, name) = take_till1(|c: char| c == ':').parse(input)?;
    let (input, _) = char(':').parse(input)?;
    let (input, value) = rest(input)?;
    Ok((input, (name.trim(), value.trim())))
}

fn complete<'a, T>(
    what: &str,
    input: &'a str,
    parser: impl Fn(&'a str) -> Res<'a, T>,
) -> Result<T> {
    match parser(input) {
        Ok((remaining, value)) if remaining.trim().is_empty() => Ok(value),
        Ok((remaining, _)) => Err(Error::SipMessageError(format!(
            "trailing data in {}: {:?}",
            what, remaining
        ))),
        Err(e) => Err(Error::SipMessageError(format!(
            "invalid {} {:?}: {}",
            what, input, e
        ))),
    }
}

pub fn parse_uri(input: &str) -> Result<SipUri> {
    complete("uri", input, uri)
}

pub fn parse_name_addr(input: &str) -> Result<NameAddr> {
    complete("name-addr", input, name_addr)
}

pub fn parse_via(input: &str) -> Result<Via> {
    complete("Via", input, via)
}

pub fn parse_cseq(input: &str) -> Result<CSeq> {
    complete("CSeq", input, cseq)
}

/// Splits `Digest a="b", c=d` into its scheme and lower-cased parameters.
pub fn parse_auth_params(input: &str) -> Result<(String, Vec<(String, String)>)> {
    complete("authentication header", input, auth_header)
}

/// Splits a header value on commas outside quotes and angle brackets.
pub fn split_values(value: &str) -> Vec<&str> {
    let mut values = Vec::new();
    let mut in_quotes = false;
    let mut in_angle = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angle = true,
            '>' if !in_quotes => in_angle = false,
            ',' if !in_quotes && !in_angle => {
                values.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    values.push(value[start..].trim());
    values.retain(|v| !v.is_empty());
    values
}

fn find_head_end(data: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, pos + 4));
    }
    data.windows(2)
        .position(|w| w == b"\n\n")
        .map(|pos| (pos, pos + 2))
}

/// Parses one complete message. Header values are kept raw; a
/// Content-Length shorter than the payload truncates the body.
pub fn parse_message(data: &[u8]) -> Result<SipMessage> {
    let (head_end, body_start) = find_head_end(data).unwrap_or((data.len(), data.len()));
    let head = std::str::from_utf8(&data[..head_end])
        .map_err(|e| Error::SipMessageError(format!("headers are not UTF-8: {}", e)))?;
    let mut lines = head.trim_start_matches(['\r', '\n']).lines();
    let first = lines
        .next()
        .ok_or_else(|| Error::SipMessageError("empty message".to_string()))?;
    let start = complete("start line", first.trim_end(), |i| {
        alt((status_line, request_line)).parse(i)
    })?;

    let mut unfolded: Vec<String> = Vec::new();
    for line in lines {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = unfolded.last_mut() {
                last.push(' ');
                last.push_str(line.trim());
                continue;
            }
        }
        if !line.trim().is_empty() {
            unfolded.push(line.trim_end().to_string());
        }
    }

    let mut headers = Headers::new();
    for line in &unfolded {
        let (name, value) = complete("header", line.as_str(), header_line)?;
        let name = canonical_name(name);
        if MULTI_VALUE_HEADERS.contains(&name.as_str()) && value != "*" {
            for part in split_values(value) {
                headers.push(Header::new(&name, part));
            }
        } else {
            headers.push(Header::new(&name, value));
        }
    }

    let mut body = data[body_start.min(data.len())..].to_vec();
    if let Some(length) = headers.value("Content-Length") {
        let length: usize = length
            .trim()
            .parse()
            .map_err(|e| Error::SipMessageError(format!("invalid Content-Length: {}", e)))?;
        if length > body.len() {
            return Err(Error::SipMessageError(format!(
                "Content-Length {} exceeds body of {} bytes",
                length,
                body.len()
            )));
        }
        body.truncate(length);
    }

    Ok(match start {
        StartLine::Request(method, uri) => SipMessage::Request(Request {
            method,
            uri,
            headers,
            body,
        }),
        StartLine::Response(status, reason) => SipMessage::Response(Response {
            status,
            reason,
            headers,
            body,
        }),
    })
}
