// src/pipeline/formats.rs

use serde::Deserialize;
use serde_json::{json, Value};
use url::form_urlencoded;
use url::Url;

use super::registry::{options, BuildError};
use super::state::RequestContext;
use crate::model::{Banner, Image};

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FormatOptions {
    /// 监测服务地址，为空时生成相对路径
    pub base_url: String,
}

/// **渲染格式**：把胜出创意渲染成广告素材
#[derive(Debug, Clone, PartialEq)]
pub enum Format {
    Html(FormatOptions),
    Native(FormatOptions),
    Vast(FormatOptions),
    Json(FormatOptions),
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn cdata(value: &str) -> String {
    format!("<![CDATA[{}]]>", value.replace("]]>", "]]]]><![CDATA[>"))
}

fn image_json(image: &Option<Image>) -> Value {
    match image {
        Some(image) => json!({ "url": image.url, "width": image.width, "height": image.height }),
        None => Value::Null,
    }
}

impl Format {
    pub fn prototypes() -> Vec<Format> {
        vec![
            Format::Html(FormatOptions::default()),
            Format::Native(FormatOptions::default()),
            Format::Vast(FormatOptions::default()),
            Format::Json(FormatOptions::default()),
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Format::Html(_) => "html",
            Format::Native(_) => "native",
            Format::Vast(_) => "vast",
            Format::Json(_) => "json",
        }
    }

    pub fn copy(&self, config: &toml::Value) -> Result<Format, BuildError> {
        let options: FormatOptions = options("format", self.name(), config)?;
        if !options.base_url.is_empty() {
            Url::parse(&options.base_url).map_err(|error| BuildError::Invalid {
                plugin: self.name().to_string(),
                reason: format!("base_url: {error}"),
            })?;
        }
        Ok(match self {
            Format::Html(_) => Format::Html(options),
            Format::Native(_) => Format::Native(options),
            Format::Vast(_) => Format::Vast(options),
            Format::Json(_) => Format::Json(options),
        })
    }

    fn options(&self) -> &FormatOptions {
        match self {
            Format::Html(options) | Format::Native(options) | Format::Vast(options) | Format::Json(options) => options,
        }
    }

    /// 本服务的监测地址：`{base_url}/{event}?banner=&req=&uid=`
    pub fn tracker(&self, event: &str, banner: &Banner, context: &RequestContext) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("banner", &banner.id.to_string());
        query.append_pair("req", &context.request_id);
        if let Some(user) = &context.user_id {
            query.append_pair("uid", user);
        }
        format!(
            "{}/{}?{}",
            self.options().base_url.trim_end_matches('/'),
            event,
            query.finish()
        )
    }

    /// JSON 类格式返回对象，标记类格式返回字符串
    pub fn render_value(&self, banner: &Banner, context: &RequestContext) -> Value {
        let impression = self.tracker("impression", banner, context);
        let click = self.tracker("click", banner, context);

        match self {
            Format::Html(_) => Value::String(self.html(banner, &impression, &click)),
            Format::Vast(_) => Value::String(self.vast(banner, &impression, &click)),
            Format::Native(_) => json!({
                "id": banner.id,
                "title": banner.title,
                "description": banner.description,
                "label": banner.label,
                "image": image_json(&banner.image),
                "icon": image_json(&banner.icon),
                "link": click,
                "impression_tracking": impression,
                "click_tracking": click,
                "impression_trackers": banner.trackers.impression.iter().collect::<Vec<_>>(),
            }),
            Format::Json(_) => json!({
                "id": banner.id,
                "title": banner.title,
                "label": banner.label,
                "description": banner.description,
                "price": banner.price,
                "image": image_json(&banner.image),
                "icon": image_json(&banner.icon),
                "target": banner.trackers.target,
                "impression_url": impression,
                "click_url": click,
                "trackers": {
                    "click": banner.trackers.click,
                    "impression": banner.trackers.impression,
                },
            }),
        }
    }

    pub fn render(&self, banner: &Banner, context: &RequestContext) -> String {
        match self.render_value(banner, context) {
            Value::String(markup) => markup,
            value => value.to_string(),
        }
    }

    fn html(&self, banner: &Banner, impression: &str, click: &str) -> String {
        let creative = match &banner.image {
            Some(image) => format!(
                "<img src=\"{}\" width=\"{}\" height=\"{}\" alt=\"{}\" border=\"0\" />",
                escape(&image.url),
                image.width,
                image.height,
                escape(&banner.title)
            ),
            None => escape(&banner.title),
        };
        // 隐形曝光像素
        let mut pixels = format!(
            "<img src=\"{}\" width=\"1\" height=\"1\" style=\"display:none;\" />",
            escape(impression)
        );
        if let Some(third_party) = &banner.trackers.impression {
            pixels.push_str(&format!(
                "<img src=\"{}\" width=\"1\" height=\"1\" style=\"display:none;\" />",
                escape(third_party)
            ));
        }
        format!(
            "<a href=\"{}\" target=\"_blank\" rel=\"noopener\">{}</a>{}",
            escape(click),
            creative,
            pixels
        )
    }

    fn vast(&self, banner: &Banner, impression: &str, click: &str) -> String {
        let mut impressions = format!("<Impression>{}</Impression>", cdata(impression));
        if let Some(third_party) = &banner.trackers.impression {
            impressions.push_str(&format!("<Impression>{}</Impression>", cdata(third_party)));
        }
        let media = banner
            .image
            .as_ref()
            .map(|image| {
                format!(
                    "<MediaFiles><MediaFile delivery=\"progressive\" type=\"video/mp4\" width=\"{}\" height=\"{}\">{}</MediaFile></MediaFiles>",
                    image.width,
                    image.height,
                    cdata(&image.url)
                )
            })
            .unwrap_or_default();

        format!(
            "<VAST version=\"3.0\"><Ad id=\"{id}\"><InLine><AdSystem>rust-adserver</AdSystem>\
             <AdTitle>{title}</AdTitle>{impressions}<Creatives><Creative><Linear>\
             <Duration>00:00:15</Duration><VideoClicks><ClickThrough>{click}</ClickThrough></VideoClicks>\
             {media}</Linear></Creative></Creatives></InLine></Ad></VAST>",
            id = banner.id,
            title = cdata(&banner.title),
            click = cdata(click),
        )
    }
}

/// 按请求要求的格式名选择，否则用路由的第一个格式
pub fn pick<'a>(formats: &'a [Format], requested: Option<&str>) -> Option<&'a Format> {
    requested
        .and_then(|name| formats.iter().find(|format| format.name() == name))
        .or_else(|| formats.first())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::fixtures::banner;
    use chrono::Utc;

    fn context() -> RequestContext {
        let mut context = RequestContext::new("req-7".into(), Utc::now().fixed_offset());
        context.user_id = Some("u 1".into());
        context
    }

    fn format(prototype: Format, base_url: &str) -> Format {
        let config: toml::Value = toml::from_str(&format!("base_url = \"{base_url}\"")).expect("valid toml");
        prototype.copy(&config).expect("valid format options")
    }

    #[test]
    fn tracker_urls_are_derived_from_base_url() {
        let html = format(Format::Html(FormatOptions::default()), "https://tk.example.com/");
        let url = html.tracker("impression", &banner(3, 100), &context());
        assert_eq!(url, "https://tk.example.com/impression?banner=3&req=req-7&uid=u+1");
    }

    #[test]
    fn html_links_click_and_hides_impression_pixel() {
        let html = format(Format::Html(FormatOptions::default()), "https://tk.example.com");
        let markup = html.render(&banner(3, 100), &context());
        assert!(markup.starts_with("<a href=\"https://tk.example.com/click?banner=3&amp;req=req-7"));
        assert!(markup.contains("src=\"https://cdn.example.com/3.png\""));
        assert!(markup.contains("style=\"display:none;\""));
    }

    #[test]
    fn native_carries_tracking_fields() {
        let native = format(Format::Native(FormatOptions::default()), "https://tk.example.com");
        let value = native.render_value(&banner(3, 100), &context());
        assert_eq!(value["title"], "banner 3");
        assert!(value["impression_tracking"]
            .as_str()
            .is_some_and(|url| url.starts_with("https://tk.example.com/impression")));
        assert!(value["click_tracking"]
            .as_str()
            .is_some_and(|url| url.starts_with("https://tk.example.com/click")));
    }

    #[test]
    fn vast_has_impression_and_click_through() {
        let vast = format(Format::Vast(FormatOptions::default()), "https://tk.example.com");
        let markup = vast.render(&banner(3, 100), &context());
        assert!(markup.starts_with("<VAST version=\"3.0\">"));
        assert!(markup.contains("<InLine>"));
        assert!(markup.contains("<Impression><![CDATA[https://tk.example.com/impression?banner=3"));
        assert!(markup.contains("<ClickThrough><![CDATA[https://tk.example.com/click?banner=3"));
    }

    #[test]
    fn json_is_plain_banner_fields() {
        let json_format = Format::Json(FormatOptions::default());
        let value = json_format.render_value(&banner(4, 250), &context());
        assert_eq!(value["price"], 250);
        assert_eq!(value["target"], "https://landing.example.com/4");
        assert_eq!(value["impression_url"], "/impression?banner=4&req=req-7&uid=u+1");
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let config: toml::Value = toml::from_str("base_url = \"not a url\"").expect("valid toml");
        assert!(Format::Html(FormatOptions::default()).copy(&config).is_err());
    }

    #[test]
    fn pick_prefers_requested_format() {
        let formats = vec![Format::Html(FormatOptions::default()), Format::Native(FormatOptions::default())];
        assert_eq!(pick(&formats, Some("native")).map(Format::name), Some("native"));
        assert_eq!(pick(&formats, Some("vast")).map(Format::name), Some("html"));
        assert_eq!(pick(&formats, None).map(Format::name), Some("html"));
        assert!(pick(&[], None).is_none());
    }
}
