use serde::{Deserialize, Serialize};

/// OpenRTB 2.x BidRequest，只保留决策用到的字段，其余字段忽略
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct BidRequest {
    pub id: String,
    #[serde(default)]
    pub imp: Vec<Imp>,
    pub app: Option<App>,
    pub site: Option<Site>,
    pub device: Option<Device>,
    pub user: Option<User>,
    /// 屏蔽的应用 bundle
    #[serde(default)]
    pub bapp: Vec<String>,
    pub cur: Option<Vec<String>>,
    pub test: Option<i32>,
    pub tmax: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Imp {
    pub id: String,
    pub tagid: Option<String>,
    pub bidfloor: Option<f64>,
    pub banner: Option<Format>,
    pub video: Option<Format>,
    pub native: Option<Native>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Format {
    pub w: Option<i32>,
    pub h: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Native {
    pub request: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct App {
    pub id: Option<String>,
    pub name: Option<String>,
    pub bundle: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Site {
    pub id: Option<String>,
    pub domain: Option<String>,
    pub page: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Device {
    pub ua: Option<String>,
    pub ip: Option<String>,
    pub ipv6: Option<String>,
    pub geo: Option<Geo>,
    pub connectiontype: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Geo {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct User {
    pub id: Option<String>,
    pub buyeruid: Option<String>,
    pub geo: Option<Geo>,
    #[serde(default)]
    pub data: Vec<Data>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Data {
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub segment: Vec<Segment>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Segment {
    pub id: String,
    pub name: Option<String>,
}

impl BidRequest {
    /// 请求体解码（simd-json 需要可写缓冲区）
    pub fn decode(body: &[u8]) -> Result<Self, simd_json::Error> {
        let mut buffer = body.to_vec();
        simd_json::serde::from_slice(&mut buffer)
    }

    pub fn device_ip(&self) -> Option<&str> {
        let device = self.device.as_ref()?;
        device.ip.as_deref().or(device.ipv6.as_deref())
    }

    /// 设备地理位置优先，其次是用户地理位置
    pub fn geo(&self) -> Option<&Geo> {
        self.device
            .as_ref()
            .and_then(|device| device.geo.as_ref())
            .or_else(|| self.user.as_ref().and_then(|user| user.geo.as_ref()))
    }

    pub fn user_id(&self) -> Option<&str> {
        let user = self.user.as_ref()?;
        user.id.as_deref().or(user.buyeruid.as_deref())
    }

    /// 所有数据提供方的人群分段 ID
    pub fn segments(&self) -> Vec<String> {
        self.user
            .iter()
            .flat_map(|user| user.data.iter())
            .flat_map(|data| data.segment.iter())
            .map(|segment| segment.id.clone())
            .collect()
    }

    /// OpenRTB `connectiontype` 枚举对应的网络类型名
    pub fn network(&self) -> Option<&'static str> {
        let kind = self.device.as_ref()?.connectiontype?;
        match kind {
            1 => Some("ethernet"),
            2 => Some("wifi"),
            3 => Some("cellular"),
            4 => Some("2g"),
            5 => Some("3g"),
            6 => Some("4g"),
            7 => Some("5g"),
            _ => None,
        }
    }
}
